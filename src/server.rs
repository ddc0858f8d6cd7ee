use crate::{*, error::*, log::*, settings::*, arch::*, dwarf::*, expr::Printer, ptrace::*, symbols::*};
use bitflags::*;
use libc::pid_t;
use std::{collections::{HashMap, VecDeque}, fmt::Write as FmtWrite, fs, mem, os::unix::fs::FileExt, sync::{Arc, Condvar, Mutex, mpsc}, thread};

// The debug server proper. One dispatcher thread owns all mutable state and
// drains two request lanes; ptrace syscalls go through the PtraceIo thread.
// Breakpoint requests get their own lane so they can preempt a long cont():
// the wait loop polls that lane and hands the pending call back to the resume
// handler, which stops the target, reconfigures, and continues.

pub enum Request {
    Breakpoint {address: String},
    Close {fd: usize},
    Eval {expr: String},
    Frames {count: usize},
    Open {name: String, mode: String},
    ReadAt {fd: usize, offset: u64, len: usize},
    Resume,
    Run,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub pc: u64,
    pub sp: u64,
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub s: String,
}

pub enum Response {
    Breakpoint,
    Close,
    Eval {result: Vec<String>},
    Frames {frames: Vec<Frame>},
    Open,
    ReadAt {data: Vec<u8>},
    Resume {status: Status},
    Run,
}

struct Call {
    req: Request,
    done: mpsc::Sender<Result<Response>>,
}

#[derive(Default)]
struct Queues {
    breakpoint: VecDeque<Call>,
    other: VecDeque<Call>,
}

struct Lanes {
    queues: Mutex<Queues>,
    wake: Condvar,
}

impl Lanes {
    fn new() -> Self {
        Lanes {queues: Mutex::new(Queues::default()), wake: Condvar::new()}
    }

    fn push(&self, breakpoint_lane: bool, call: Call) {
        let mut lock = self.queues.lock().unwrap();
        if breakpoint_lane {
            lock.breakpoint.push_back(call);
        } else {
            lock.other.push_back(call);
        }
        self.wake.notify_one();
    }

    fn pop_blocking(&self) -> Call {
        let mut lock = self.queues.lock().unwrap();
        loop {
            if let Some(c) = lock.breakpoint.pop_front() {
                return c;
            }
            if let Some(c) = lock.other.pop_front() {
                return c;
            }
            lock = self.wake.wait(lock).unwrap();
        }
    }

    fn try_pop_breakpoint(&self) -> Option<Call> {
        self.queues.lock().unwrap().breakpoint.pop_front()
    }
}

bitflags! {
    pub struct OpenMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

struct FileEntry {
    mode: OpenMode,
    file: fs::File,
}

#[derive(Clone, Copy)]
pub struct Breakpoint {
    pub pc: u64,
    pub orig_instr: [u8; MAX_BREAKPOINT_SIZE],
}

// PCs of the runtime functions that terminate a logical stack. All zero until
// resolved; resolved lazily on the first stack walk and invalidated by Run.
#[derive(Default)]
struct RuntimeAnchors {
    evaluated: bool,
    eval_err: Option<Error>,
    goexit: u64,
    mstart: u64,
    mcall: u64,
    morestack: u64,
    lessstack: u64,
    rt0_go: u64,
    // Nonzero only for Windows targets, which the ELF-only loader never produces.
    externalthreadhandlerp: u64,
}

impl RuntimeAnchors {
    fn clear(&mut self) {
        *self = RuntimeAnchors::default();
    }

    fn top_of_stack(&self, func_entry: u64) -> bool {
        func_entry == self.goexit
            || func_entry == self.mstart
            || func_entry == self.mcall
            || func_entry == self.morestack
            || func_entry == self.lessstack
            || func_entry == self.rt0_go
            || (self.externalthreadhandlerp != 0 && func_entry == self.externalthreadhandlerp)
    }
}

// Client handle. Methods serialize on the dispatcher; safe to clone and use
// from any thread.
#[derive(Clone)]
pub struct Server {
    lanes: Arc<Lanes>,
}

impl Server {
    pub fn new(executable: &str, arch: Arch, dwarf: Box<dyn DwarfData + Send>, symbols: Box<dyn SymbolSource + Send>, printer: Box<dyn Printer + Send>, settings: Settings) -> Result<Server> {
        // The loader has already parsed the binary; still insist the path is
        // a real file so a later Run doesn't fail mysteriously.
        match fs::metadata(executable) {
            Err(e) => return Err(Error::from_io_error(e, format!("executable {:?}", executable))),
            Ok(m) if !m.is_file() => return err!(UnsupportedExecutable, "not a regular file: {:?}", executable),
            Ok(_) => {}
        }
        let lanes = Arc::new(Lanes::new());
        let state = ServerState::new(executable, arch, dwarf, symbols, printer, settings, lanes.clone());
        thread::Builder::new().name("dispatcher".into()).spawn(move || state.run_loop()).unwrap();
        Ok(Server {lanes})
    }

    fn call(&self, breakpoint_lane: bool, req: Request) -> Result<Response> {
        let (done, wait) = mpsc::channel();
        self.lanes.push(breakpoint_lane, Call {req, done});
        match wait.recv() {
            Ok(r) => r,
            Err(_) => err!(Internal, "server is gone"),
        }
    }

    pub fn open(&self, name: &str, mode: &str) -> Result<()> {
        match self.call(false, Request::Open {name: name.to_string(), mode: mode.to_string()})? {
            Response::Open => Ok(()),
            _ => err!(Internal, "mismatched response"),
        }
    }

    pub fn read_at(&self, fd: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self.call(false, Request::ReadAt {fd, offset, len})? {
            Response::ReadAt {data} => Ok(data),
            _ => err!(Internal, "mismatched response"),
        }
    }

    pub fn close(&self, fd: usize) -> Result<()> {
        match self.call(false, Request::Close {fd})? {
            Response::Close => Ok(()),
            _ => err!(Internal, "mismatched response"),
        }
    }

    pub fn run(&self) -> Result<()> {
        match self.call(false, Request::Run)? {
            Response::Run => Ok(()),
            _ => err!(Internal, "mismatched response"),
        }
    }

    pub fn resume(&self) -> Result<Status> {
        match self.call(false, Request::Resume)? {
            Response::Resume {status} => Ok(status),
            _ => err!(Internal, "mismatched response"),
        }
    }

    pub fn breakpoint(&self, address: &str) -> Result<()> {
        match self.call(true, Request::Breakpoint {address: address.to_string()})? {
            Response::Breakpoint => Ok(()),
            _ => err!(Internal, "mismatched response"),
        }
    }

    pub fn eval(&self, expr: &str) -> Result<Vec<String>> {
        match self.call(false, Request::Eval {expr: expr.to_string()})? {
            Response::Eval {result} => Ok(result),
            _ => err!(Internal, "mismatched response"),
        }
    }

    pub fn frames(&self, count: usize) -> Result<Vec<Frame>> {
        match self.call(false, Request::Frames {count})? {
            Response::Frames {frames} => Ok(frames),
            _ => err!(Internal, "mismatched response"),
        }
    }
}

enum WaitEvent {
    Stopped(pid_t, WaitStatus),
    BreakpointsChanged(Call),
}

enum TrapOutcome {
    Trapped(pid_t),
    Changed(Call),
}

struct ServerState {
    executable: String,
    arch: Arch,
    dwarf: Box<dyn DwarfData + Send>,
    symbols: Box<dyn SymbolSource + Send>,
    printer: Box<dyn Printer + Send>,
    settings: Settings,
    ptrace: PtraceIo,
    lanes: Arc<Lanes>,

    child: Option<pid_t>,
    proc_is_up: bool,
    stopped_pid: pid_t,
    stopped_regs: libc::user_regs_struct,
    anchors: RuntimeAnchors,
    breakpoints: HashMap<u64, Breakpoint>,
    files: Vec<Option<FileEntry>>,
    log: Log,
}

impl ServerState {
    fn new(executable: &str, arch: Arch, dwarf: Box<dyn DwarfData + Send>, symbols: Box<dyn SymbolSource + Send>, printer: Box<dyn Printer + Send>, settings: Settings, lanes: Arc<Lanes>) -> Self {
        ServerState {
            executable: executable.to_string(),
            arch, dwarf, symbols, printer, settings,
            ptrace: PtraceIo::new(),
            lanes,
            child: None,
            proc_is_up: false,
            stopped_pid: 0,
            stopped_regs: unsafe {mem::zeroed()},
            anchors: RuntimeAnchors::default(),
            breakpoints: HashMap::new(),
            files: Vec::new(),
            log: Log::new(),
        }
    }

    fn run_loop(mut self) {
        // Runs for the life of the process, like the ptrace thread.
        loop {
            let call = self.lanes.pop_blocking();
            self.dispatch(call);
        }
    }

    fn dispatch(&mut self, call: Call) {
        let result = match call.req {
            Request::Breakpoint {address} => self.handle_breakpoint(&address).map(|()| Response::Breakpoint),
            Request::Close {fd} => self.handle_close(fd).map(|()| Response::Close),
            Request::Eval {expr} => self.handle_eval(&expr).map(|result| Response::Eval {result}),
            Request::Frames {count} => self.handle_frames(count).map(|frames| Response::Frames {frames}),
            Request::Open {name, mode} => self.handle_open(&name, &mode).map(|()| Response::Open),
            Request::ReadAt {fd, offset, len} => self.handle_read_at(fd, offset, len).map(|data| Response::ReadAt {data}),
            Request::Resume => self.handle_resume().map(|status| Response::Resume {status}),
            Request::Run => self.handle_run().map(|()| Response::Run),
        };
        let _ = call.done.send(result);
    }

    fn handle_open(&mut self, name: &str, mode: &str) -> Result<()> {
        let mode = match mode {
            "r" => OpenMode::READ,
            "w" => OpenMode::WRITE,
            "rw" => OpenMode::READ | OpenMode::WRITE,
            _ => return err!(Usage, "open: bad open mode {:?}", mode),
        };
        let file = fs::OpenOptions::new()
            .read(mode.contains(OpenMode::READ))
            .write(mode.contains(OpenMode::WRITE))
            .open(name)
            .map_err(|e| Error::from_io_error(e, format!("open {:?}", name)))?;
        let entry = FileEntry {mode, file};
        // Lowest free slot is the descriptor.
        match self.files.iter().position(|f| f.is_none()) {
            Some(idx) => self.files[idx] = Some(entry),
            None => self.files.push(Some(entry)),
        }
        Ok(())
    }

    fn handle_read_at(&mut self, fd: usize, offset: u64, len: usize) -> Result<Vec<u8>> {
        let entry = match self.files.get(fd) {
            Some(Some(f)) => f,
            _ => return err!(Usage, "read_at: bad file descriptor {}", fd),
        };
        let mut buf = vec![0u8; len];
        let n = entry.file.read_at(&mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn handle_close(&mut self, fd: usize) -> Result<()> {
        match self.files.get_mut(fd) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => err!(Usage, "close: bad file descriptor {}", fd),
        }
    }

    fn handle_run(&mut self) -> Result<()> {
        if let Some(pid) = self.child.take() {
            unsafe {libc::kill(pid, libc::SIGKILL)};
            // Reap it so a later waitpid(-1) can't pick up the corpse.
            let _ = self.ptrace.waitpid(pid, 0);
            log!(self.log, "killed child {}", pid);
        }
        self.proc_is_up = false;
        self.stopped_pid = 0;
        self.stopped_regs = unsafe {mem::zeroed()};
        self.anchors.clear();
        let files = self.spawn_files()?;
        let pid = self.ptrace.start(&self.executable, files)?;
        log!(self.log, "started child {}", pid);
        self.child = Some(pid);
        self.stopped_pid = pid;
        Ok(())
    }

    fn spawn_files(&self) -> Result<SpawnFiles> {
        let stdin_path = self.settings.stdin_file.as_deref().unwrap_or("/dev/null");
        let stdin = fs::File::open(stdin_path).map_err(|e| Error::from_io_error(e, format!("stdin {:?}", stdin_path)))?;
        let stdout = match &self.settings.stdout_file {
            None => None,
            Some(p) => Some(fs::File::create(p).map_err(|e| Error::from_io_error(e, format!("stdout {:?}", p)))?),
        };
        let stderr = match &self.settings.stderr_file {
            None => None,
            Some(p) => Some(fs::File::create(p).map_err(|e| Error::from_io_error(e, format!("stderr {:?}", p)))?),
        };
        Ok(SpawnFiles {stdin, stdout, stderr})
    }

    fn handle_resume(&mut self) -> Result<Status> {
        if self.child.is_none() {
            return err!(ProcessState, "resume: run did not successfully start a process");
        }

        if !self.proc_is_up {
            // First resume after run: consume the stop-on-exec, then ask the
            // kernel to report clones so new threads stay traced.
            self.proc_is_up = true;
            match self.wait_for_trap(self.stopped_pid, false)? {
                TrapOutcome::Trapped(_) => {}
                TrapOutcome::Changed(_) => return err!(BreakpointsChanged, "breakpoints changed during initial stop"),
            }
            self.ptrace.set_options(self.stopped_pid, libc::PTRACE_O_TRACECLONE).map_err(|e| error!(Ptrace, "ptrace set options: {}", e))?;
        } else if self.breakpoints.contains_key(&self.stopped_regs.rip) {
            // Stopped on a breakpoint: the table still holds the original
            // instruction, so execute it before re-arming.
            self.ptrace.single_step(self.stopped_pid).map_err(|e| error!(Ptrace, "ptrace single-step: {}", e))?;
            match self.wait_for_trap(self.stopped_pid, false)? {
                TrapOutcome::Trapped(_) => {}
                TrapOutcome::Changed(_) => return err!(BreakpointsChanged, "breakpoints changed during single-step"),
            }
        }

        loop {
            self.set_breakpoints()?;
            self.ptrace.cont(self.stopped_pid, 0).map_err(|e| error!(Ptrace, "ptrace cont: {}", e))?;

            match self.wait_for_trap(-1, true)? {
                TrapOutcome::Trapped(wpid) => {
                    self.stopped_pid = wpid;
                    break;
                }
                TrapOutcome::Changed(call) => {
                    // A breakpoint request arrived while the target was
                    // running. Stop it, reconfigure while its text holds
                    // original instructions, then continue.
                    if unsafe {libc::kill(self.stopped_pid, libc::SIGSTOP)} != 0 {
                        return errno_err!("kill(SIGSTOP) failed");
                    }
                    let (_, status) = self.ptrace.waitpid(self.stopped_pid, 0).map_err(|e| error!(ProcessState, "wait (after SIGSTOP): {}", e))?;
                    if !status.stopped() || status.stop_signal() != libc::SIGSTOP {
                        return err!(ProcessState, "wait (after SIGSTOP): unexpected wait status {:#x}", status.0);
                    }

                    self.lift_breakpoints()?;

                    let mut call = call;
                    loop {
                        self.dispatch(call);
                        match self.lanes.try_pop_breakpoint() {
                            Some(c) => call = c,
                            None => break,
                        }
                    }
                }
            }
        }
        self.lift_breakpoints()?;

        let mut regs = self.ptrace.get_regs(self.stopped_pid).map_err(|e| error!(Ptrace, "ptrace get regs: {}", e))?;
        // The trap byte already executed, so the PC sits just past the
        // breakpoint; move it back onto the instruction.
        regs.rip -= self.arch.breakpoint_size as u64;
        self.ptrace.set_regs(self.stopped_pid, &regs).map_err(|e| error!(Ptrace, "ptrace set regs: {}", e))?;
        self.stopped_regs = regs;

        Ok(Status {pc: regs.rip, sp: regs.rsp})
    }

    // Wait for the next event. With allow_breakpoints_change, a pending
    // request on the breakpoint lane takes precedence over target events and
    // is handed back to the caller.
    fn wait(&mut self, pid: pid_t, allow_breakpoints_change: bool) -> Result<WaitEvent> {
        if !allow_breakpoints_change {
            let (wpid, status) = self.ptrace.waitpid(pid, 0)?;
            return Ok(WaitEvent::Stopped(wpid, status));
        }
        // Blocking in waitpid would deafen us to the control plane, so poll
        // both the lane and the wait status.
        loop {
            if let Some(call) = self.lanes.try_pop_breakpoint() {
                return Ok(WaitEvent::BreakpointsChanged(call));
            }
            let (wpid, status) = self.ptrace.waitpid(pid, libc::WNOHANG)?;
            if wpid != 0 {
                return Ok(WaitEvent::Stopped(wpid, status));
            }
            thread::sleep(self.settings.wait_poll_interval);
        }
    }

    // Wait until the target stops with a SIGTRAP that isn't a clone event;
    // other signals and clone stops are passed through with cont.
    fn wait_for_trap(&mut self, pid: pid_t, allow_breakpoints_change: bool) -> Result<TrapOutcome> {
        loop {
            let (wpid, status) = match self.wait(pid, allow_breakpoints_change).map_err(|e| error!(ProcessState, "wait: {}", e))? {
                WaitEvent::BreakpointsChanged(call) => return Ok(TrapOutcome::Changed(call)),
                WaitEvent::Stopped(p, s) => (p, s),
            };
            if status.exited() {
                self.child = None;
                return err!(ProcessState, "process {} exited with status {}", wpid, status.exit_status());
            }
            if status.signaled() {
                self.child = None;
                return err!(ProcessState, "process {} killed by signal {}", wpid, status.term_signal());
            }
            if status.stop_signal() == libc::SIGTRAP && status.trap_cause() != libc::PTRACE_EVENT_CLONE {
                return Ok(TrapOutcome::Trapped(wpid));
            }
            self.ptrace.cont(wpid, 0).map_err(|e| error!(Ptrace, "ptrace cont: {}", e))?;
        }
    }

    fn handle_breakpoint(&mut self, address: &str) -> Result<()> {
        // The expression may fan out (a regex) to several PCs; install at all
        // of them. There is deliberately no remove operation.
        let addrs = self.handle_eval(address)?;
        for addr in &addrs {
            let pc = expr::eval_address(&*self.symbols, addr)?;
            if self.breakpoints.contains_key(&pc) {
                return err!(Usage, "breakpoint already set at {:#x}", pc);
            }
            let mut bp = Breakpoint {pc, orig_instr: [0; MAX_BREAKPOINT_SIZE]};
            let n = self.arch.breakpoint_size;
            self.ptrace.peek(self.stopped_pid, pc, &mut bp.orig_instr[..n]).map_err(|e| error!(Ptrace, "ptrace peek: {}", e))?;
            self.breakpoints.insert(pc, bp);
            log!(self.log, "breakpoint installed at {:#x}", pc);
        }
        Ok(())
    }

    fn set_breakpoints(&self) -> Result<()> {
        for pc in self.breakpoints.keys() {
            self.ptrace.poke(self.stopped_pid, *pc, self.arch.breakpoint_bytes()).map_err(|e| error!(Ptrace, "set breakpoints: {}", e))?;
        }
        Ok(())
    }

    fn lift_breakpoints(&self) -> Result<()> {
        for (pc, bp) in &self.breakpoints {
            self.ptrace.poke(self.stopped_pid, *pc, &bp.orig_instr[..self.arch.breakpoint_size]).map_err(|e| error!(Ptrace, "lift breakpoints: {}", e))?;
        }
        Ok(())
    }

    fn handle_eval(&mut self, e: &str) -> Result<Vec<String>> {
        expr::eval(&*self.symbols, &*self.dwarf, &*self.printer, e)
    }

    fn handle_frames(&mut self, count: usize) -> Result<Vec<Frame>> {
        if !self.anchors.evaluated {
            self.evaluate_anchors();
        }
        if let Some(e) = &self.anchors.eval_err {
            return Err(e.clone());
        }

        let regs = self.ptrace.get_regs(self.stopped_pid).map_err(|e| error!(Ptrace, "ptrace get regs: {}", e))?;
        let (mut pc, mut sp) = (regs.rip, regs.rsp);
        let ptr_size = self.arch.pointer_size;

        let mut frames = Vec::new();
        for _ in 0..count {
            let fp_offset = self.dwarf.pc_to_sp_offset(pc)?;
            let fp = sp.wrapping_add(fp_offset as u64);

            let mut text = format!("PC={:#x}, SP={:#x}:", pc, sp);
            let func = self.dwarf.function_for_pc(pc)?;
            for child in &func.children {
                if child.tag != gimli::DW_TAG_formal_parameter {
                    continue;
                }
                if child.has_children {
                    return err!(Dwarf, "formal parameter has children, expected none");
                }
                let mut offset = 0i64;
                let mut name = "arg";
                for field in &child.fields {
                    if field.attr == gimli::DW_AT_location {
                        if let DieValue::Bytes(b) = &field.value {
                            offset = eval_location(b);
                        }
                    } else if field.attr == gimli::DW_AT_name {
                        if let DieValue::Str(n) = &field.value {
                            name = n;
                        }
                    }
                }
                let addr = fp.wrapping_add(offset as u64);
                match self.printer.sprint_entry(child, addr) {
                    Ok(v) => write!(text, " {} ({}(FP)) = {}", name, offset, v)?,
                    Err(e) => write!(text, " {} ({}(FP)) = ({})", name, offset, e)?,
                }
            }
            frames.push(Frame {s: text});

            // Walk to the caller unless this function tops a logical stack.
            if self.anchors.top_of_stack(func.entry_pc) {
                break;
            }
            let mut buf = [0u8; 8];
            self.ptrace.peek(self.stopped_pid, fp - ptr_size as u64, &mut buf[..ptr_size]).map_err(|e| error!(Ptrace, "ptrace peek: {}", e))?;
            pc = self.arch.uintptr(&buf[..ptr_size]);
            sp = fp;
        }
        Ok(frames)
    }

    fn evaluate_anchors(&mut self) {
        self.anchors.clear();
        self.anchors.evaluated = true;
        let names = ["runtime.goexit", "runtime.mstart", "runtime.mcall", "runtime.morestack", "runtime.lessstack", "_rt0_go"];
        let mut pcs = [0u64; 6];
        for (i, name) in names.iter().enumerate() {
            match self.symbols.function_pc(name) {
                Ok(pc) => pcs[i] = pc,
                Err(e) => {
                    self.anchors.eval_err = Some(e);
                    return;
                }
            }
        }
        // runtime.externalthreadhandlerp exists only in Windows builds of the
        // runtime; with ELF-only targets it stays 0 and never terminates a walk.
        [self.anchors.goexit, self.anchors.mstart, self.anchors.mcall, self.anchors.morestack, self.anchors.lessstack, self.anchors.rt0_go] = pcs;
    }
}

#[cfg(test)]
mod tests {
    use crate::server::*;
    use crate::{*, error::*, settings::*, dwarf::*, expr::Printer, symbols::*};
    use std::{fs, io::Write as IoWrite, sync::{Arc, Mutex}};

    // Tests that spawn a real child share the process-wide child table (the
    // wait loop uses waitpid(-1)), so they must not overlap.
    static CHILD_TEST_LOCK: Mutex<()> = Mutex::new(());

    struct NoDwarf;
    impl DwarfData for NoDwarf {
        fn pc_to_line(&self, _pc: u64) -> Result<(String, u64)> { err!(Dwarf, "no line table") }
        fn pc_to_sp_offset(&self, _pc: u64) -> Result<i64> { err!(Dwarf, "no sp-offset table") }
        fn function_for_pc(&self, _pc: u64) -> Result<FunctionEntry> { err!(Dwarf, "no entry") }
    }

    struct NoPrinter;
    impl Printer for NoPrinter {
        fn sprint(&self, _expr: &str) -> Result<String> { err!(Internal, "no printer") }
        fn sprint_entry(&self, _entry: &DieEntry, _addr: u64) -> Result<String> { err!(Internal, "no printer") }
    }

    fn base_symbols() -> FlatSymbolTable {
        let mut syms = FlatSymbolTable::new();
        syms.insert("main.main", 0x401000);
        syms.insert("main.helper", 0x401800);
        syms
    }

    fn test_server() -> Server {
        Server::new("/bin/true", arch::AMD64, Box::new(NoDwarf), Box::new(base_symbols()), Box::new(NoPrinter), Settings::default()).unwrap()
    }

    fn temp_file(tag: &str, content: &[u8]) -> String {
        let path = std::env::temp_dir().join(format!("goprobe-test-{}-{}", tag, std::process::id()));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn file_table_lifecycle() {
        let srv = test_server();
        let path = temp_file("filetable", b"hello, debugger");

        assert!(srv.open(&path, "a").unwrap_err().is_usage());
        assert!(srv.read_at(0, 0, 4).unwrap_err().is_usage());

        srv.open(&path, "r").unwrap();
        assert_eq!(srv.read_at(0, 7, 64).unwrap(), b"debugger");
        assert_eq!(srv.read_at(0, 0, 5).unwrap(), b"hello");

        // Second descriptor, then free the first and watch the slot get reused.
        srv.open(&path, "r").unwrap();
        srv.close(0).unwrap();
        assert!(srv.read_at(0, 0, 1).unwrap_err().is_usage());
        assert!(srv.close(0).unwrap_err().is_usage());
        srv.open(&path, "r").unwrap();
        assert_eq!(srv.read_at(0, 0, 5).unwrap(), b"hello");
        assert_eq!(srv.read_at(1, 0, 5).unwrap(), b"hello");

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn eval_through_dispatcher() {
        let srv = test_server();
        assert_eq!(srv.eval("addr:main.main").unwrap(), ["0x401000"]);
        assert_eq!(srv.eval("re:^main\\.").unwrap(), ["main.main", "main.helper"]);
        assert_eq!(srv.eval("0x401803").unwrap(), ["main.helper"]);
        assert!(srv.eval("nonsense").unwrap_err().is_syntax());
    }

    #[test]
    fn breakpoint_with_bad_expression() {
        let srv = test_server();
        // Travels the breakpoint lane but fails in eval, before any ptrace.
        assert!(srv.breakpoint("re:[").unwrap_err().is_syntax());
        assert!(srv.breakpoint("nonsense").unwrap_err().is_syntax());
    }

    #[test]
    fn resume_without_run_fails() {
        let srv = test_server();
        assert!(srv.resume().unwrap_err().is_process_state());
    }

    #[test]
    fn frames_without_runtime_symbols() {
        // The anchor table is resolved before registers are read, so this
        // fails with MissingSymbols even with no child process.
        let srv = test_server();
        assert!(srv.frames(1).unwrap_err().is_missing_symbols());
    }

    #[test]
    fn anchor_resolution_and_top_of_stack() {
        let mut syms = FlatSymbolTable::new();
        let names = ["runtime.goexit", "runtime.mstart", "runtime.mcall", "runtime.morestack", "runtime.lessstack", "_rt0_go"];
        for (i, n) in names.iter().enumerate() {
            syms.insert(n, 0x500000 + i as u64 * 0x100);
        }
        let lanes = Arc::new(Lanes::new());
        let mut state = ServerState::new("/bin/true", arch::AMD64, Box::new(NoDwarf), Box::new(syms), Box::new(NoPrinter), Settings::default(), lanes);

        state.evaluate_anchors();
        assert!(state.anchors.evaluated);
        assert!(state.anchors.eval_err.is_none());
        assert_eq!(state.anchors.goexit, 0x500000);
        assert_eq!(state.anchors.externalthreadhandlerp, 0);
        for i in 0..names.len() {
            assert!(state.anchors.top_of_stack(0x500000 + i as u64 * 0x100));
        }
        assert!(!state.anchors.top_of_stack(0x123456));
        // A function entry of 0 must not read as the (absent) Windows anchor.
        assert!(!state.anchors.top_of_stack(0));

        // Run invalidates the cache.
        state.anchors.eval_err = Some(error!(MissingSymbols, "x"));
        state.anchors.clear();
        assert!(!state.anchors.evaluated && state.anchors.eval_err.is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn run_to_exit_and_restart() {
        if !std::path::Path::new("/bin/true").exists() {
            return;
        }
        let _guard = CHILD_TEST_LOCK.lock().unwrap();
        let srv = test_server();
        srv.run().unwrap();
        // /bin/true has no breakpoints set, so the first resume consumes the
        // exec stop and the continue runs the child to completion; that exit
        // is reported as an error rather than a stop.
        let e = srv.resume().unwrap_err();
        assert!(e.is_process_state(), "unexpected error: {}", e);

        // Run again restarts from scratch.
        srv.run().unwrap();
        let e = srv.resume().unwrap_err();
        assert!(e.is_process_state(), "unexpected error: {}", e);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stdout_redirect() {
        if !std::path::Path::new("/bin/echo").exists() {
            return;
        }
        let _guard = CHILD_TEST_LOCK.lock().unwrap();
        let out_path = std::env::temp_dir().join(format!("goprobe-test-stdout-{}", std::process::id()));
        let settings = Settings {stdout_file: Some(out_path.to_str().unwrap().to_string()), ..Settings::default()};
        let srv = Server::new("/bin/echo", arch::AMD64, Box::new(NoDwarf), Box::new(base_symbols()), Box::new(NoPrinter), settings).unwrap();
        srv.run().unwrap();
        let _ = srv.resume(); // runs to exit
        let out = fs::read(&out_path).unwrap();
        assert_eq!(out, b"\n");
        let _ = fs::remove_file(&out_path);
    }
}
