//! Chrome trace-event output, for "-d trace".
//! Load the resulting file in chrome://tracing or https://ui.perfetto.dev.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(&mut self, name: &str, tid: usize, start: Instant, end: Instant) {
        let _ = write!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ph\": \"X\", \"ts\": {}, \"dur\": {} }},\n",
            tid,
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros()
        );
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_complete("main", 0, start, Instant::now());
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap() = Some(trace);
    Ok(())
}

pub fn if_enabled(f: impl FnOnce(&mut dyn FnMut(&str, usize, Instant, Instant))) {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        f(&mut |name, tid, start, end| trace.write_complete(name, tid, start, end));
    }
}

/// Time a scope, attributing it to the main track.
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    if_enabled(|write| write(name, 0, start, end));
    result
}

pub fn close() -> std::io::Result<()> {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        return trace.close();
    }
    Ok(())
}
