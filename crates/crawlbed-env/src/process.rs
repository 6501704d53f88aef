use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

#[cfg(unix)]
fn unix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

/// Whether a process with this pid exists. Always true where that cannot be checked.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(pid) = unix_pid(pid) else {
        return false;
    };
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    true
}

#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};

    let Some(target) = unix_pid(pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}"),
        ));
    };
    match kill(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> io::Result<()> {
    let status = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("taskkill exited with {status}")))
    }
}

/// True when something accepts TCP connections on `host:port`.
pub fn port_accepts(host: &str, port: u16) -> bool {
    let Ok(addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok())
}

/// True when the OS lets us bind `host:port` right now.
pub fn port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

pub fn wait_for_port_closed(host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !port_accepts(host, port) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::{is_alive, port_accepts, port_available, wait_for_port_closed};
    use std::net::TcpListener;
    use std::time::Duration;

    #[test]
    fn current_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn reaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn should work");
        let pid = child.id();
        child.wait().expect("wait should work");
        assert!(!is_alive(pid));
    }

    #[test]
    fn bound_port_is_busy_and_accepting() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind should work");
        let port = listener.local_addr().expect("addr should work").port();

        assert!(!port_available("127.0.0.1", port));
        assert!(port_accepts("127.0.0.1", port));

        drop(listener);
        assert!(wait_for_port_closed("127.0.0.1", port, Duration::from_secs(2)));
        assert!(port_available("127.0.0.1", port));
    }
}
