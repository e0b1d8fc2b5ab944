#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::io::{IsTerminal, stdout};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Turns off `ECHOCTL` while alive so Ctrl+C does not print `^C` over the
/// progress line. Restores the saved terminal state on drop.
pub struct EchoGuard {
    #[cfg(unix)]
    saved: Option<Termios>,
}

impl EchoGuard {
    pub fn new() -> Self {
        #[cfg(unix)]
        {
            Self {
                saved: disable_echoctl(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

#[cfg(unix)]
fn disable_echoctl() -> Option<Termios> {
    if !stdout().is_terminal() {
        return None;
    }
    let fd = stdout().as_raw_fd();
    let saved = Termios::from_fd(fd).ok()?;
    let mut quiet = saved;
    quiet.c_lflag &= !ECHOCTL;
    tcsetattr(fd, TCSANOW, &quiet).ok()?;
    Some(saved)
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(saved) = &self.saved {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, saved).ok();
        }
    }
}
