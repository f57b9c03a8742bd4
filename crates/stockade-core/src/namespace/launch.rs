//! Launch of the container entry process inside its namespaces.
//!
//! The process is cloned straight into the requested namespaces and parked
//! on a start pipe. While it waits, the parent writes id maps, attaches it to
//! its cgroup, and moves its network endpoint in. [`PendingProcess::release`]
//! then lets it switch root and `execve` the entrypoint; any failure on that
//! path comes back over a close-on-exec error pipe.
//!
//! The child is a copy of a multi-threaded process whose other threads may
//! have held the allocator or logging locks at the time of the clone. It
//! therefore only runs system calls on data prepared in [`ChildPlan`], and
//! reports failures as a fixed step name plus errno.

use std::ffi::CString;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{AccessFlags, Gid, Pid, Uid, access};
use stockade_common::config::IdMapConfig;
use stockade_common::error::{Result, StockadeError};
use stockade_common::spec::ContainerSpec;
use stockade_common::types::NamespaceKind;

use super::NamespaceSet;
use crate::filesystem::FilesystemMount;
use crate::filesystem::mount::path_cstring;
use crate::filesystem::pivot_root::RootSwitch;

/// Stack size for the cloned child before it execs.
const STACK_SIZE: usize = 1024 * 1024;

/// Exit code of a child that failed before `execve`.
pub const LAUNCH_FAILURE_EXIT: i32 = 127;

/// A failure in the cloned child before `execve`.
///
/// Holds only a fixed step description and the errno, so building and
/// reporting one never allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildFault {
    /// What the child was doing.
    pub step: &'static str,
    /// Why it failed.
    pub errno: Errno,
}

impl ChildFault {
    /// Writes the errno followed by the step name.
    fn report(self, mut pipe: &File) {
        let _ = pipe.write_all(&(self.errno as i32).to_ne_bytes());
        let _ = pipe.write_all(self.step.as_bytes());
    }
}

/// Tags a failed system call with the step it belongs to.
pub(crate) trait AtStep<T> {
    fn at(self, step: &'static str) -> std::result::Result<T, ChildFault>;
}

impl<T> AtStep<T> for nix::Result<T> {
    fn at(self, step: &'static str) -> std::result::Result<T, ChildFault> {
        self.map_err(|errno| ChildFault { step, errno })
    }
}

/// Turns a child's report into a message naming the program.
fn describe_report(report: &[u8], program: &str) -> String {
    match report.split_first_chunk::<4>() {
        Some((code, step)) => format!(
            "{} for {program}: {}",
            String::from_utf8_lossy(step),
            Errno::from_raw(i32::from_ne_bytes(*code))
        ),
        None => format!("{program}: truncated launch report"),
    }
}

/// Everything the child needs, converted before cloning.
#[derive(Debug)]
struct ChildPlan {
    root: RootSwitch,
    become_root: bool,
    hostname: Option<String>,
    cwd: CString,
    candidates: Vec<CString>,
    argv: ExecArray,
    envp: ExecArray,
}

impl ChildPlan {
    fn new(set: &NamespaceSet, rootfs: &FilesystemMount, spec: &ContainerSpec) -> Result<Self> {
        let process = &spec.process;
        let program = process
            .entrypoint
            .first()
            .ok_or_else(|| launch_error("entrypoint is empty"))?;
        let candidates = resolve_candidates(program, process.search_path())
            .iter()
            .map(|path| to_cstring(path.as_os_str().as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let argv = process
            .entrypoint
            .iter()
            .map(|arg| to_cstring(arg.as_bytes()))
            .collect::<Result<Vec<_>>>()?;
        let envp = process
            .env_pairs()
            .iter()
            .map(|pair| to_cstring(pair.as_bytes()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root: RootSwitch::plan(
                &rootfs.merged_dir,
                set.isolates(NamespaceKind::Mnt),
                set.isolates(NamespaceKind::Pid),
            )?,
            become_root: set.isolates(NamespaceKind::User),
            hostname: set
                .isolates(NamespaceKind::Uts)
                .then(|| spec.hostname().to_owned()),
            cwd: path_cstring(&process.cwd)?,
            candidates,
            argv: ExecArray::new(argv),
            envp: ExecArray::new(envp),
        })
    }
}

/// The null-terminated pointer array `execve(2)` expects, together with the
/// strings it points into.
#[derive(Debug)]
struct ExecArray {
    _strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl ExecArray {
    fn new(strings: Vec<CString>) -> Self {
        // Each CString owns a heap buffer, so the pointers survive moves.
        let ptrs = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        Self {
            _strings: strings,
            ptrs,
        }
    }

    fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// Lists the paths the entrypoint may resolve to, in `PATH` order.
///
/// A program containing `/` is used as given.
#[must_use]
pub fn resolve_candidates(program: &str, search_path: &str) -> Vec<PathBuf> {
    if program.contains('/') {
        return vec![PathBuf::from(program)];
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .collect()
}

/// A cloned process parked before its entrypoint.
///
/// Dropping it without calling [`Self::release`] kills and reaps the child.
#[derive(Debug)]
pub struct PendingProcess {
    pid: Pid,
    program: String,
    start_tx: Option<File>,
    error_rx: Option<File>,
}

impl PendingProcess {
    /// Returns the host PID of the child.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Lets the child switch root and exec the entrypoint, and waits until it
    /// has done so. Returns the PID on success.
    ///
    /// # Errors
    ///
    /// Returns [`StockadeError::ProcessLaunch`] with the child's report if any
    /// step before `execve` failed. The child has been reaped in that case.
    pub fn release(mut self) -> Result<u32> {
        let pid = self.pid();
        let mut start_tx = self
            .start_tx
            .take()
            .ok_or_else(|| launch_error("process already released"))?;
        let mut error_rx = self
            .error_rx
            .take()
            .ok_or_else(|| launch_error("process already released"))?;

        if let Err(e) = start_tx.write_all(&[1]) {
            self.kill_and_reap();
            return Err(launch_error(&format!("cannot signal child {pid}: {e}")));
        }
        drop(start_tx);

        let mut report = Vec::new();
        if let Err(e) = error_rx.read_to_end(&mut report) {
            tracing::warn!(pid, error = %e, "cannot read launch report");
        }
        if !report.is_empty() {
            self.kill_and_reap();
            return Err(launch_error(&describe_report(&report, &self.program)));
        }

        // Ownership passes to the caller's reaper.
        self.pid = Pid::from_raw(0);
        tracing::info!(pid, "entry process released");
        Ok(pid)
    }

    /// Kills the parked child and reaps it.
    pub fn abort(mut self) {
        self.kill_and_reap();
    }

    fn kill_and_reap(&mut self) {
        self.start_tx = None;
        self.error_rx = None;
        if self.pid.as_raw() <= 0 {
            return;
        }
        let pid = self.pid;
        self.pid = Pid::from_raw(0);
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                tracing::warn!(pid = pid.as_raw(), error = %e, "cannot kill pending process");
            }
        }
        if let Err(e) = waitpid(pid, None) {
            tracing::warn!(pid = pid.as_raw(), error = %e, "cannot reap pending process");
        }
        tracing::debug!(pid = pid.as_raw(), "pending process aborted");
    }
}

impl Drop for PendingProcess {
    fn drop(&mut self) {
        self.kill_and_reap();
    }
}

/// Clones the entry process into the namespaces of `set`, writes its id maps
/// when a user namespace is isolated, and holds its namespace references.
///
/// # Errors
///
/// Returns [`StockadeError::ProcessLaunch`] if the spec cannot be converted
/// for `execve` or `clone(2)` fails, and [`StockadeError::NamespaceSetup`]
/// if id mapping or namespace references fail. The child is killed and
/// reaped on every error path.
pub fn spawn(
    set: &mut NamespaceSet,
    rootfs: &FilesystemMount,
    spec: &ContainerSpec,
    id_map: &IdMapConfig,
) -> Result<PendingProcess> {
    let plan = ChildPlan::new(set, rootfs, spec)?;
    let (start_rx, start_tx) = pipe()?;
    let (error_rx, error_tx) = pipe()?;
    let parent_ends = [start_tx.as_raw_fd(), error_rx.as_raw_fd()];

    let mut stack = vec![0u8; STACK_SIZE];
    let child = Box::new(|| {
        for fd in parent_ends {
            // SAFETY: the child owns a private copy of the fd table; closing
            // the parent's ends here lets it observe EOF on the start pipe.
            let _ = unsafe { libc::close(fd) };
        }
        child_main(&start_rx, &error_tx, &plan)
    });
    // SAFETY: without CLONE_VM the child runs on a private copy of the
    // address space, so the closure and the stack stay valid for it, and
    // the parent may free both once `clone` returns.
    let pid = unsafe { nix::sched::clone(child, &mut stack, set.clone_flags(), Some(libc::SIGCHLD)) }
        .map_err(|e| launch_error(&format!("clone failed: {e}")))?;
    drop(start_rx);
    drop(error_tx);

    let pending = PendingProcess {
        pid,
        program: spec.process.entrypoint.first().cloned().unwrap_or_default(),
        start_tx: Some(start_tx),
        error_rx: Some(error_rx),
    };
    let child_pid = pending.pid();
    tracing::info!(id = %spec.id, pid = child_pid, flags = ?set.clone_flags(), "entry process cloned");

    if set.isolates(NamespaceKind::User) {
        if let Err(e) = super::user::write_id_maps(child_pid, id_map) {
            pending.abort();
            return Err(e);
        }
    }
    if let Err(e) = set.hold_refs(child_pid) {
        pending.abort();
        set.close();
        return Err(e);
    }
    Ok(pending)
}

fn child_main(start_rx: &File, error_tx: &File, plan: &ChildPlan) -> isize {
    let mut go = [0u8; 1];
    loop {
        match (&*start_rx).read(&mut go) {
            Ok(1) => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            _ => return 1,
        }
    }
    let fault = enter_and_exec(plan);
    fault.report(error_tx);
    LAUNCH_FAILURE_EXIT as isize
}

/// Runs in the child: switches root, sets the hostname, and execs. Returns
/// only on failure.
fn enter_and_exec(plan: &ChildPlan) -> ChildFault {
    match prepare_child(plan) {
        Ok(program) => {
            // SAFETY: `program` and every entry of both arrays point into
            // C strings owned by `plan`, and both arrays end with null.
            let _ = unsafe { libc::execve(program.as_ptr(), plan.argv.as_ptr(), plan.envp.as_ptr()) };
            ChildFault {
                step: "execve",
                errno: Errno::last(),
            }
        }
        Err(fault) => fault,
    }
}

fn prepare_child(plan: &ChildPlan) -> std::result::Result<&CString, ChildFault> {
    if plan.become_root {
        nix::unistd::setgid(Gid::from_raw(0)).at("setgid(0)")?;
        nix::unistd::setuid(Uid::from_raw(0)).at("setuid(0)")?;
    }
    plan.root.enter()?;
    if let Some(hostname) = &plan.hostname {
        super::uts::set_hostname(hostname).at("sethostname")?;
    }
    nix::unistd::chdir(plan.cwd.as_c_str()).at("chdir to working directory")?;
    plan.candidates
        .iter()
        .find(|path| access(path.as_c_str(), AccessFlags::X_OK).is_ok())
        .ok_or(ChildFault {
            step: "entrypoint not found or not executable",
            errno: Errno::ENOENT,
        })
}

fn pipe() -> Result<(File, File)> {
    let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| launch_error(&format!("pipe2 failed: {e}")))?;
    Ok((File::from(read), File::from(write)))
}

fn to_cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| launch_error("argument or environment contains a NUL byte"))
}

fn launch_error(message: &str) -> StockadeError {
    StockadeError::ProcessLaunch {
        message: message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use super::*;

    #[test]
    fn bare_program_is_searched_along_path() {
        assert_eq!(
            resolve_candidates("sh", "/usr/bin::/bin"),
            vec![PathBuf::from("/usr/bin/sh"), PathBuf::from("/bin/sh")]
        );
    }

    #[test]
    fn program_with_slash_is_used_verbatim() {
        assert_eq!(
            resolve_candidates("./run.sh", "/bin"),
            vec![PathBuf::from("./run.sh")]
        );
    }

    fn spec(yaml: &str) -> ContainerSpec {
        ContainerSpec::from_str_validated(yaml).unwrap()
    }

    fn strings_of(array: &ExecArray) -> Vec<String> {
        let (last, entries) = array.ptrs.split_last().unwrap();
        assert!(last.is_null());
        entries
            .iter()
            // SAFETY: every entry points into a CString owned by `array`.
            .map(|&ptr| unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn exec_arrays_are_null_terminated_and_outlive_moves() {
        let array = ExecArray::new(vec![CString::new("sh").unwrap(), CString::new("-c").unwrap()]);
        let moved = vec![array];
        assert_eq!(strings_of(&moved[0]), ["sh", "-c"]);
    }

    #[test]
    fn child_report_names_step_program_and_errno() {
        let mut report = (Errno::EACCES as i32).to_ne_bytes().to_vec();
        report.extend_from_slice(b"chdir to working directory");
        let message = describe_report(&report, "/bin/app");
        assert!(message.starts_with("chdir to working directory for /bin/app: "));
        assert!(message.contains(&Errno::EACCES.to_string()));
        assert!(describe_report(b"ab", "app").contains("truncated"));
    }

    #[test]
    fn plan_is_fully_converted_before_clone() {
        let spec = spec(
            "id: job\nrootfs: {lower: [/l]}\nnamespaces: [uts, user]\nprocess:\n  entrypoint: [app, --flag]\n  cwd: /work\n  env:\n    PATH: /opt:/bin\n",
        );
        let set = NamespaceSet {
            requested: spec.namespaces.clone(),
            refs: Vec::new(),
        };
        let root = FilesystemMount::new(PathBuf::from("/srv/job"), Vec::new());
        let plan = ChildPlan::new(&set, &root, &spec).unwrap();

        assert!(plan.become_root);
        assert_eq!(plan.hostname.as_deref(), Some("job"));
        assert_eq!(plan.cwd.as_c_str(), c"/work");
        assert_eq!(
            plan.candidates,
            vec![CString::new("/opt/app").unwrap(), CString::new("/bin/app").unwrap()]
        );
        assert_eq!(strings_of(&plan.argv), ["app", "--flag"]);
        assert!(strings_of(&plan.envp).contains(&"PATH=/opt:/bin".to_owned()));
    }

    #[test]
    fn failure_before_exec_is_reported_with_the_program() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec("id: job\nrootfs: {lower: [/l]}\nprocess:\n  entrypoint: [/no/such/app]\n");
        let mut set = NamespaceSet::create_isolated(&spec.namespaces).unwrap();
        let root = FilesystemMount::new(dir.path().to_path_buf(), Vec::new());
        std::fs::create_dir(&root.merged_dir).unwrap();

        let pending = spawn(&mut set, &root, &spec, &IdMapConfig::default()).unwrap();
        // Unprivileged runs stop at chroot; root gets as far as the lookup.
        let err = pending.release().unwrap_err();
        assert!(matches!(err, StockadeError::ProcessLaunch { .. }));
        assert!(err.to_string().contains("/no/such/app"));
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(matches!(
            to_cstring(b"a\0b"),
            Err(StockadeError::ProcessLaunch { .. })
        ));
    }
}
