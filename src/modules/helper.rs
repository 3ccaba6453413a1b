//! Runs an external helper program to completion.
//!
//! Used by the legacy driver facility, which shells out to the system's
//! load/unload utilities instead of calling the kernel extension manager.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, error};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};

/// Exit status reported when the child could not exec the program.
pub const EXEC_FAILED: i32 = 127;

/// A program plus its arguments, run via fork/exec/wait.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl HelperCommand {
    /// Creates a command for `program` with no arguments.
    ///
    /// # Arguments
    ///
    /// * `program` - Absolute path of the executable. No `PATH` search is done.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Forks, execs the program in the child and waits for it.
    ///
    /// # Returns
    ///
    /// * `Ok(status)` - the child's exit status
    /// * `Err` if the fork failed or the child was killed by a signal
    pub fn run(&self) -> Result<i32> {
        // Build argv before forking so the child only execs.
        let path = CString::new(self.program.as_os_str().as_bytes())
            .context("Program path contains a NUL byte")?;
        let mut argv = vec![path.clone()];
        for arg in &self.args {
            argv.push(CString::new(arg.as_str()).context("Argument contains a NUL byte")?);
        }

        debug!("Running {} {:?}", self.program.display(), self.args);
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = execv(&path, &argv);
                unsafe { libc::_exit(EXEC_FAILED) }
            }
            Ok(ForkResult::Parent { child }) => wait_for(child, &self.program),
            Err(err) => {
                error!("Fork failed: {}", err);
                Err(err.into())
            }
        }
    }
}

fn wait_for(child: Pid, program: &Path) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, status)) => return Ok(status),
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                bail!("{} terminated by {}", program.display(), signal)
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                return Err(anyhow!(err)).with_context(|| format!("Failed to wait for {}", program.display()))
            }
        }
    }
}
