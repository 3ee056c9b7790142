use sysinfo::{ProcessesToUpdate, System};

/// Snapshot of running processes as `(executable name, pid)`, sorted by name.
pub fn scan_processes() -> Vec<(String, u32)> {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    let mut processes = system
        .processes()
        .iter()
        .map(|(pid, proc_)| (proc_.name().to_string_lossy().into_owned(), pid.as_u32()))
        .collect::<Vec<_>>();
    processes.sort_by(|(a, _), (b, _)| a.cmp(b));
    processes
}

/// PID of the first process in `processes` whose executable name equals `name`, ignoring
/// case.
pub fn find_in<I, S>(processes: I, name: &str) -> Option<u32>
where
    I: IntoIterator<Item = (S, u32)>,
    S: AsRef<str>,
{
    processes
        .into_iter()
        .find(|(candidate, _)| candidate.as_ref().eq_ignore_ascii_case(name))
        .map(|(_, pid)| pid)
}

/// PID of a running process by executable name (e.g. `"notepad.exe"`), ignoring case.
pub fn find_process_id(name: &str) -> Option<u32> {
    find_in(scan_processes(), name)
}
