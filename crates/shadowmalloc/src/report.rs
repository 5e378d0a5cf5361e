//! Structured diagnostic events and the reporter seam.
//!
//! The allocator never formats its own reports; it emits typed events to
//! whatever `Reporter` is installed. The default reporter writes a plain
//! rendering to stderr. Fatal conditions emit their events and then abort
//! the process: once a memory-safety violation is detected the application
//! is not trusted to continue.

use crate::sync::Mutex;
use crate::trace::StackTrace;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AddrRelation {
    Inside,
    Left,
    Right,
    /// Reverse lookup found a chunk but none of the containment predicates
    /// matched; indicates an internal inconsistency.
    Around,
}

pub struct HeapAddressReport {
    pub addr: usize,
    pub access_size: usize,
    pub relation: AddrRelation,
    pub offset: usize,
    pub region_beg: usize,
    pub region_size: usize,
    pub alloc_tid: i32,
    pub free_tid: Option<i32>,
    pub alloc_trace: StackTrace,
    pub free_trace: Option<StackTrace>,
}

pub enum ReportEvent<'a> {
    OutOfMemory {
        context: &'static str,
        size: usize,
        tid: i32,
        trace: Option<&'a StackTrace>,
    },
    DoubleFree {
        addr: usize,
        trace: &'a StackTrace,
    },
    FreeNotMalloced {
        addr: usize,
        trace: &'a StackTrace,
    },
    HeapAddress(&'a HeapAddressReport),
    /// A new chunk-carving mapping was obtained (debug mode only).
    MmapRange { beg: usize, end: usize },
    /// Periodic allocator status (stats mode only).
    Status {
        quarantine_bytes: usize,
        free_list_bytes: usize,
    },
}

pub trait Reporter: Sync {
    fn event(&self, event: &ReportEvent<'_>);
}

static REPORTER: Mutex<Option<&'static dyn Reporter>> = Mutex::new(None);

/// Install a reporter. The default stderr reporter is used until this is
/// called.
pub fn set_reporter(reporter: &'static dyn Reporter) {
    *REPORTER.lock() = Some(reporter);
}

/// Deliver an event to the installed reporter.
pub fn emit(event: &ReportEvent<'_>) {
    let installed = *REPORTER.lock();
    let reporter: &dyn Reporter = installed.unwrap_or(&StderrReporter);
    reporter.event(event);
}

/// Terminate the process. Used after a fatal event has been emitted.
pub fn die() -> ! {
    unsafe { libc::abort() }
}

/// Write a line straight to stderr fd 2 without touching the process
/// allocator's locks.
pub fn write_stderr(msg: &str) {
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    }
}

/// Default sink: renders events in the classic sanitizer wording.
pub struct StderrReporter;

impl StderrReporter {
    fn print_trace(trace: &StackTrace) {
        for i in 0..trace.size {
            write_stderr(&format!("    #{} 0x{:x}\n", i, trace.pcs[i]));
        }
    }
}

impl Reporter for StderrReporter {
    fn event(&self, event: &ReportEvent<'_>) {
        match event {
            ReportEvent::OutOfMemory {
                context,
                size,
                tid,
                trace,
            } => {
                write_stderr(&format!(
                    "==shadowmalloc== ERROR: failed to allocate 0x{:x} ({}) bytes ({}) in T{}\n",
                    size, size, context, tid
                ));
                if let Some(trace) = trace {
                    Self::print_trace(trace);
                }
            }
            ReportEvent::DoubleFree { addr, trace } => {
                write_stderr(&format!(
                    "shadowmalloc: attempting double-free on 0x{:x}:\n",
                    addr
                ));
                Self::print_trace(trace);
            }
            ReportEvent::FreeNotMalloced { addr, trace } => {
                write_stderr(&format!(
                    "shadowmalloc: attempting free on address which was not malloc()-ed: 0x{:x}\n",
                    addr
                ));
                Self::print_trace(trace);
            }
            ReportEvent::HeapAddress(report) => {
                let relation = match report.relation {
                    AddrRelation::Inside => "bytes inside of",
                    AddrRelation::Left => "bytes to the left of",
                    AddrRelation::Right => "bytes to the right of",
                    AddrRelation::Around => "bytes somewhere around",
                };
                write_stderr(&format!(
                    "0x{:x} is located {} {} {}-byte region [0x{:x},0x{:x})\n",
                    report.addr,
                    report.offset,
                    relation,
                    report.region_size,
                    report.region_beg,
                    report.region_beg + report.region_size
                ));
                if let (Some(free_tid), Some(free_trace)) = (report.free_tid, &report.free_trace) {
                    write_stderr(&format!("freed by thread T{} here:\n", free_tid));
                    Self::print_trace(free_trace);
                    write_stderr(&format!(
                        "previously allocated by thread T{} here:\n",
                        report.alloc_tid
                    ));
                    Self::print_trace(&report.alloc_trace);
                } else {
                    write_stderr(&format!(
                        "allocated by thread T{} here:\n",
                        report.alloc_tid
                    ));
                    Self::print_trace(&report.alloc_trace);
                }
            }
            ReportEvent::MmapRange { beg, end } => {
                write_stderr(&format!("shadowmalloc mmap: [0x{:x}, 0x{:x})\n", beg, end));
            }
            ReportEvent::Status {
                quarantine_bytes,
                free_list_bytes,
            } => {
                write_stderr(&format!(
                    "shadowmalloc status: quarantine {} bytes, free lists {} bytes\n",
                    quarantine_bytes, free_list_bytes
                ));
            }
        }
    }
}
