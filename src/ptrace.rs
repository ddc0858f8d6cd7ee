use crate::{*, error::*};
use libc::pid_t;
use std::{fs, mem, ptr, ffi::CString, os::raw::{c_char, c_uint}, os::unix::io::AsRawFd, sync::mpsc, thread};

// All ptrace calls for a tracee must come from the thread that owns the
// attachment; with PTRACE_TRACEME children that's the thread that forked.
// So one dedicated thread issues every ptrace call (and the fork itself);
// everyone else ships it an operation record and blocks on the reply.

pub unsafe fn ptrace(request: c_uint, pid: pid_t, addr: u64, data: u64) -> Result<i64> {
    (*libc::__errno_location()) = 0;
    let r = libc::ptrace(request, pid, addr, data);
    if r == -1 {
        if (*libc::__errno_location()) != 0 {
            return errno_err!("ptrace({}) failed", ptrace_request_name(request));
        }
        // Peek requests can legitimately return -1.
        assert!([libc::PTRACE_PEEKDATA, libc::PTRACE_PEEKTEXT, libc::PTRACE_PEEKUSER].contains(&request));
    }
    Ok(r)
}

pub fn ptrace_request_name(c: c_uint) -> &'static str {
    match c {
        libc::PTRACE_TRACEME => "PTRACE_TRACEME", libc::PTRACE_PEEKTEXT => "PTRACE_PEEKTEXT", libc::PTRACE_PEEKDATA => "PTRACE_PEEKDATA", libc::PTRACE_POKETEXT => "PTRACE_POKETEXT", libc::PTRACE_POKEDATA => "PTRACE_POKEDATA", libc::PTRACE_CONT => "PTRACE_CONT", libc::PTRACE_SINGLESTEP => "PTRACE_SINGLESTEP", libc::PTRACE_GETREGS => "PTRACE_GETREGS", libc::PTRACE_SETREGS => "PTRACE_SETREGS", libc::PTRACE_SETOPTIONS => "PTRACE_SETOPTIONS", libc::PTRACE_KILL => "PTRACE_KILL",
        _ => "?",
    }
}

// Thin view over the raw wait status word, mirroring the handful of
// accessors the wait loop needs.
#[derive(Clone, Copy, Debug)]
pub struct WaitStatus(pub i32);

impl WaitStatus {
    pub fn exited(self) -> bool { libc::WIFEXITED(self.0) }
    pub fn exit_status(self) -> i32 { libc::WEXITSTATUS(self.0) }
    pub fn signaled(self) -> bool { libc::WIFSIGNALED(self.0) }
    pub fn term_signal(self) -> i32 { libc::WTERMSIG(self.0) }
    pub fn stopped(self) -> bool { libc::WIFSTOPPED(self.0) }
    pub fn stop_signal(self) -> i32 { if self.stopped() {libc::WSTOPSIG(self.0)} else {-1} }
    // The ptrace event that caused a SIGTRAP stop (PTRACE_EVENT_*), or -1.
    pub fn trap_cause(self) -> i32 { if self.stop_signal() == libc::SIGTRAP {self.0 >> 16} else {-1} }
}

// Standard streams for a freshly spawned target, opened by the caller so a
// bad redirect path fails the request instead of killing the child mid-exec.
pub struct SpawnFiles {
    pub stdin: fs::File,
    pub stdout: Option<fs::File>,
    pub stderr: Option<fs::File>,
}

enum Req {
    Start {path: CString, files: SpawnFiles},
    Peek {pid: pid_t, addr: u64, len: usize},
    Poke {pid: pid_t, addr: u64, data: Vec<u8>},
    GetRegs {pid: pid_t},
    SetRegs {pid: pid_t, regs: Box<libc::user_regs_struct>},
    Cont {pid: pid_t, sig: i32},
    SingleStep {pid: pid_t},
    SetOptions {pid: pid_t, opts: i32},
    Wait {pid: pid_t, flags: i32},
}

enum Rep {
    Unit,
    Pid(pid_t),
    Bytes(Vec<u8>),
    Regs(Box<libc::user_regs_struct>),
    Wait(pid_t, WaitStatus),
}

struct Task {
    req: Req,
    done: mpsc::Sender<Result<Rep>>,
}

pub struct PtraceIo {
    tx: mpsc::Sender<Task>,
}

impl PtraceIo {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        thread::Builder::new().name("ptraceio".into()).spawn(move || {
            while let Ok(task) = rx.recv() {
                let r = run_request(task.req);
                let _ = task.done.send(r);
            }
        }).unwrap();
        PtraceIo {tx}
    }

    fn roundtrip(&self, req: Req) -> Result<Rep> {
        let (done, wait) = mpsc::channel();
        if self.tx.send(Task {req, done}).is_err() {
            return err!(Internal, "ptrace thread is gone");
        }
        match wait.recv() {
            Ok(r) => r,
            Err(_) => err!(Internal, "ptrace thread dropped the call"),
        }
    }

    // Fork the executable with tracing enabled; the child stops with SIGTRAP
    // once it reaches exec. Returns the child pid.
    pub fn start(&self, path: &str, files: SpawnFiles) -> Result<pid_t> {
        let c_path = match CString::new(path) {
            Ok(p) => p,
            Err(_) => return err!(Usage, "executable path contains NUL: {:?}", path),
        };
        match self.roundtrip(Req::Start {path: c_path, files})? {
            Rep::Pid(pid) => Ok(pid),
            _ => err!(Internal, "unexpected ptrace reply"),
        }
    }

    pub fn peek(&self, pid: pid_t, addr: u64, buf: &mut [u8]) -> Result<()> {
        match self.roundtrip(Req::Peek {pid, addr, len: buf.len()})? {
            Rep::Bytes(data) => {
                buf.copy_from_slice(&data);
                Ok(())
            }
            _ => err!(Internal, "unexpected ptrace reply"),
        }
    }

    pub fn poke(&self, pid: pid_t, addr: u64, data: &[u8]) -> Result<()> {
        self.roundtrip(Req::Poke {pid, addr, data: data.to_vec()})?;
        Ok(())
    }

    pub fn get_regs(&self, pid: pid_t) -> Result<libc::user_regs_struct> {
        match self.roundtrip(Req::GetRegs {pid})? {
            Rep::Regs(regs) => Ok(*regs),
            _ => err!(Internal, "unexpected ptrace reply"),
        }
    }

    pub fn set_regs(&self, pid: pid_t, regs: &libc::user_regs_struct) -> Result<()> {
        self.roundtrip(Req::SetRegs {pid, regs: Box::new(regs.clone())})?;
        Ok(())
    }

    pub fn cont(&self, pid: pid_t, sig: i32) -> Result<()> {
        self.roundtrip(Req::Cont {pid, sig})?;
        Ok(())
    }

    pub fn single_step(&self, pid: pid_t) -> Result<()> {
        self.roundtrip(Req::SingleStep {pid})?;
        Ok(())
    }

    pub fn set_options(&self, pid: pid_t, opts: i32) -> Result<()> {
        self.roundtrip(Req::SetOptions {pid, opts})?;
        Ok(())
    }

    // waitpid, routed through the same thread. flags is 0 or WNOHANG; with
    // WNOHANG a result pid of 0 means no event yet.
    pub fn waitpid(&self, pid: pid_t, flags: i32) -> Result<(pid_t, WaitStatus)> {
        match self.roundtrip(Req::Wait {pid, flags})? {
            Rep::Wait(wpid, status) => Ok((wpid, status)),
            _ => err!(Internal, "unexpected ptrace reply"),
        }
    }
}

fn run_request(req: Req) -> Result<Rep> {
    match req {
        Req::Start {path, files} => spawn_child(&path, &files).map(Rep::Pid),
        Req::Peek {pid, addr, len} => {
            let mut data = vec![0u8; len];
            let mut off = 0;
            while off < len {
                let word = unsafe {ptrace(libc::PTRACE_PEEKTEXT, pid, addr + off as u64, 0)?};
                let bytes = word.to_ne_bytes();
                let n = (len - off).min(8);
                data[off..off+n].copy_from_slice(&bytes[..n]);
                off += n;
            }
            Ok(Rep::Bytes(data))
        }
        Req::Poke {pid, addr, data} => {
            let mut off = 0;
            while off < data.len() {
                let a = addr + off as u64;
                if data.len() - off >= 8 {
                    let word = u64::from_ne_bytes(data[off..off+8].try_into().unwrap());
                    unsafe {ptrace(libc::PTRACE_POKETEXT, pid, a, word)?};
                    off += 8;
                } else {
                    // Splice the tail into the word already there.
                    let word = unsafe {ptrace(libc::PTRACE_PEEKTEXT, pid, a, 0)?};
                    let mut bytes = word.to_ne_bytes();
                    bytes[..data.len() - off].copy_from_slice(&data[off..]);
                    unsafe {ptrace(libc::PTRACE_POKETEXT, pid, a, u64::from_ne_bytes(bytes))?};
                    off = data.len();
                }
            }
            Ok(Rep::Unit)
        }
        Req::GetRegs {pid} => {
            let mut regs: libc::user_regs_struct = unsafe {mem::zeroed()};
            unsafe {ptrace(libc::PTRACE_GETREGS, pid, 0, &mut regs as *mut _ as u64)?};
            Ok(Rep::Regs(Box::new(regs)))
        }
        Req::SetRegs {pid, regs} => {
            unsafe {ptrace(libc::PTRACE_SETREGS, pid, 0, &*regs as *const _ as u64)?};
            Ok(Rep::Unit)
        }
        Req::Cont {pid, sig} => {
            unsafe {ptrace(libc::PTRACE_CONT, pid, 0, sig as u64)?};
            Ok(Rep::Unit)
        }
        Req::SingleStep {pid} => {
            unsafe {ptrace(libc::PTRACE_SINGLESTEP, pid, 0, 0)?};
            Ok(Rep::Unit)
        }
        Req::SetOptions {pid, opts} => {
            unsafe {ptrace(libc::PTRACE_SETOPTIONS, pid, 0, opts as u64)?};
            Ok(Rep::Unit)
        }
        Req::Wait {pid, flags} => {
            let mut status = 0i32;
            let r = unsafe {libc::waitpid(pid, &mut status, flags)};
            if r < 0 {
                return errno_err!("waitpid({}) failed", pid);
            }
            Ok(Rep::Wait(r, WaitStatus(status)))
        }
    }
}

fn spawn_child(path: &CString, files: &SpawnFiles) -> Result<pid_t> {
    let argv = [path.as_ptr(), ptr::null()];
    let stdin_fd = files.stdin.as_raw_fd();
    let stdout_fd = files.stdout.as_ref().map(|f| f.as_raw_fd());
    let stderr_fd = files.stderr.as_ref().map(|f| f.as_raw_fd());
    unsafe {
        let pid = libc::fork();
        if pid == 0 {
            // Child process. Do as little as possible here, avoid memory
            // allocations, and always end with either a successful exec or a
            // hard exit.
            let msg: &[u8];
            'child: {
                // Make the child die if the debugger process dies.
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) != 0 {
                    msg = b"child: prctl failed\0";
                    break 'child;
                }
                if libc::getppid() == 1 {
                    msg = b"child: parent already exited\0";
                    break 'child;
                }
                if libc::ptrace(libc::PTRACE_TRACEME, 0, 0u64, 0u64) != 0 {
                    msg = b"child: PTRACE_TRACEME failed\0";
                    break 'child;
                }
                if libc::dup2(stdin_fd, 0) < 0 {
                    msg = b"child: dup2 stdin failed\0";
                    break 'child;
                }
                if let Some(fd) = stdout_fd {
                    if libc::dup2(fd, 1) < 0 {
                        msg = b"child: dup2 stdout failed\0";
                        break 'child;
                    }
                }
                if let Some(fd) = stderr_fd {
                    if libc::dup2(fd, 2) < 0 {
                        msg = b"child: dup2 stderr failed\0";
                        break 'child;
                    }
                }
                libc::execv(argv[0], argv.as_ptr());
                msg = b"child: exec failed\0";
            }
            libc::perror(msg.as_ptr() as *const c_char);
            libc::_exit(127);
        }
        if pid < 0 {
            return errno_err!("fork() failed");
        }
        Ok(pid)
    }
}
