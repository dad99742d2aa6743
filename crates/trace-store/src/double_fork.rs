use std::{
    fs::OpenOptions,
    io,
    os::unix::io::AsRawFd,
    process::exit,
};

use libc::pid_t;
use rustix::{
    fs::Mode,
    process::{chdir, setsid, umask},
};

/// Detach from the launching process, its session and its terminal (from:
/// advanced programming in the unix environment). Only the grandchild
/// returns `Ok`; both parents exit 0 on the way.
///
/// Must run before any thread is spawned.
pub fn daemon_double_fork() -> io::Result<()> {
    do_fork()?;

    setsid()?;

    // the session leader going away must not take us with it
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // no longer a session leader, so no controlling terminal ever again
    do_fork()?;

    // no risk of pinning a mount
    chdir("/")?;

    // named objects get exactly the modes we ask for
    umask(Mode::empty());

    redirect_std_fds_to_devnull()
}

fn redirect_std_fds_to_devnull() -> io::Result<()> {
    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;

    let fd = devnull.as_raw_fd();
    for target in 0..=2 {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn do_fork() -> io::Result<()> {
    let pid: pid_t = unsafe { libc::fork() };

    match pid {
        p if p < 0 => Err(io::Error::last_os_error()),
        0 => Ok(()),  // child
        _ => exit(0), // parent
    }
}
