//! Destinations of call records.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::Path,
    sync::Arc,
    thread,
};

use arc_swap::ArcSwapOption;
use gfx_shim_common::record::CallRecord;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, trace};

/// Receives every intercepted call.
///
/// `submit` runs on the intercepted thread and must not block on I/O.
pub trait CallSink: Send + Sync {
    fn submit(&self, record: CallRecord);

    /// Stop accepting records. Records already submitted are still written.
    fn close(&self) {}
}

/// Name of the thread writing a [`JsonLinesSink`].
pub const WRITER_THREAD: &str = "gfx-shim call log";

/// Body of the writer thread, handed to the spawner of [`JsonLinesSink::open_with`].
pub type Writer = Box<dyn FnOnce() + Send + 'static>;

/// Writes records to a file, one JSON object per line, from a background thread.
#[derive(Debug)]
pub struct JsonLinesSink {
    sender: ArcSwapOption<UnboundedSender<CallRecord>>,
    finished: Arc<Finished>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating missing directories.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::open_with(path, |name, writer| {
            thread::Builder::new().name(name.to_owned()).spawn(writer)?;
            Ok(())
        })
    }

    /// Like [`JsonLinesSink::open`], with `spawn` starting the writer thread.
    ///
    /// `spawn` receives the thread name and must run the writer exactly once.
    pub fn open_with(
        path: &Path,
        spawn: impl FnOnce(&str, Writer) -> io::Result<()>,
    ) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let finished = Arc::new(Finished::default());
        spawn(
            WRITER_THREAD,
            Box::new({
                let finished = finished.clone();
                move || {
                    write_records(receiver, BufWriter::new(file));
                    finished.set();
                }
            }),
        )?;
        debug!(path = %path.display(), "call log opened");

        Ok(Self {
            sender: ArcSwapOption::new(Some(Arc::new(sender))),
            finished,
        })
    }

    /// Close the sink and wait until every submitted record is written.
    ///
    /// Must not be called while holding the loader lock.
    pub fn close_and_wait(&self) {
        self.close();
        self.finished.wait();
    }
}

/// Set by the writer once its last record is flushed.
#[derive(Debug, Default)]
struct Finished {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Finished {
    fn set(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

impl CallSink for JsonLinesSink {
    fn submit(&self, record: CallRecord) {
        if let Some(ref sender) = *self.sender.load() {
            // Only fails once the writer is gone. The record is dropped.
            let _ = sender.send(record);
        }
    }

    fn close(&self) {
        self.sender.store(None);
    }
}

fn write_records(mut receiver: UnboundedReceiver<CallRecord>, mut out: BufWriter<File>) {
    while let Some(record) = receiver.blocking_recv() {
        let mut next = Some(record);
        while let Some(record) = next {
            if let Err(err) = write_line(&mut out, &record) {
                error!("cannot write call record. err: {err}");
            }
            next = receiver.try_recv().ok();
        }

        if let Err(err) = out.flush() {
            error!("cannot flush call log. err: {err}");
        }
    }

    trace!("call log writer exited");
}

fn write_line(out: &mut impl Write, record: &CallRecord) -> io::Result<()> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<CallRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<CallRecord> {
        self.records.lock().clone()
    }
}

impl CallSink for MemorySink {
    fn submit(&self, record: CallRecord) {
        self.records.lock().push(record);
    }
}
