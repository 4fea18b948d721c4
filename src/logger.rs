//! Structured XML log merging synchronous driver events with asynchronous
//! guest serial output.
//!
//! Every public entry point that touches the log also drains whatever serial
//! chatter has piled up in the background, so the emitted XML is a causal
//! linearization of "what the driver did" and "what the guest said" (see
//! `drain`).

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use anyhow::{Context, Result};
use log::warn;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer as XmlWriter;
use regex::Regex;

/// Bounded capacity of the serial-output queue (§4.2). Once full, new
/// records are dropped rather than blocking the serial-drain worker thread:
/// the XML log is best-effort for serial chatter, while every driver event
/// that matters for pass/fail is emitted synchronously via `log`/`nested`.
const QUEUE_CAPACITY: usize = 1000;

/// A single key/value attribute on a `<line>` or `<head>` element.
pub type Attrs<'a> = &'a [(&'a str, &'a str)];

struct SerialRecord {
    machine: String,
    msg: String,
}

/// Returns the compiled "is this a C* general-category code point" matcher.
///
/// `regex`'s Unicode tables cover the `Cc`/`Cf`/`Co`/`Cs` general categories
/// that show up in real guest console output; unassigned (`Cn`) code points
/// are comparatively rare in practice and are not reliably enumerable from a
/// regex engine's tables, so this is a pragmatic stand-in for
/// `unicodedata.category(ch)[0] != "C"` rather than a byte-for-byte port.
fn control_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\p{C}").expect("static regex is valid"))
}

/// Strip every code point whose Unicode general category begins with `C`
/// (control/format/private-use/surrogate/unassigned) from `message`.
pub fn sanitise(message: &str) -> String {
    control_chars().replace_all(message, "").into_owned()
}

/// Appends structured events to an XML log, merging synchronous driver
/// events with asynchronous guest-serial output.
pub struct Logger {
    writer: Mutex<XmlWriter<Box<dyn Write + Send>>>,
    queue_tx: SyncSender<SerialRecord>,
    queue_rx: Mutex<Receiver<SerialRecord>>,
}

impl Logger {
    /// Open `path` (creating/truncating it) and start a fresh `<logfile>`
    /// document. `path` is typically `LOGFILE`, defaulting to `/dev/null`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;
        Self::new(Box::new(file))
    }

    /// Construct a logger around an arbitrary sink. Exposed so tests can
    /// point the logger at an in-memory buffer instead of a real file.
    pub fn new(sink: Box<dyn Write + Send>) -> Result<Self> {
        let mut writer = XmlWriter::new(sink);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .context("Failed to write XML declaration")?;
        writer
            .write_event(Event::Start(BytesStart::new("logfile")))
            .context("Failed to open <logfile>")?;

        let (queue_tx, queue_rx) = sync_channel(QUEUE_CAPACITY);

        Ok(Self {
            writer: Mutex::new(writer),
            queue_tx,
            queue_rx: Mutex::new(queue_rx),
        })
    }

    fn maybe_prefix(msg: &str, attrs: Attrs) -> String {
        match attrs.iter().find(|(k, _)| *k == "machine") {
            Some((_, machine)) => format!("{machine}: {msg}"),
            None => msg.to_string(),
        }
    }

    fn write_line(&self, msg: &str, attrs: Attrs) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer
            .create_element("line")
            .with_attributes(attrs.iter().copied())
            .write_text_content(BytesText::new(msg))
            .context("Failed to write <line>")?;
        Ok(())
    }

    /// Emit one `line` element and echo the (optionally machine-prefixed)
    /// message to stderr.
    pub fn log(&self, msg: &str, attrs: Attrs) {
        eprintln!("{}", Self::maybe_prefix(msg, attrs));
        self.drain();
        if let Err(e) = self.write_line(msg, attrs) {
            warn!("Failed to write log line: {e:#}");
        }
    }

    /// Non-blocking deposit of a serial-output record produced by a
    /// serial-drain worker. Drops the record if the queue is full.
    pub fn enqueue(&self, machine: &str, msg: String) {
        match self.queue_tx.try_send(SerialRecord {
            machine: machine.to_string(),
            msg,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("serial log queue full ({QUEUE_CAPACITY}), dropping record");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Flush all pending serial records into the XML stream as
    /// `line type="serial"` elements, in FIFO order.
    pub fn drain(&self) {
        let rx = self.queue_rx.lock().unwrap();
        while let Ok(record) = rx.try_recv() {
            let sanitised = sanitise(&record.msg);
            if let Err(e) = self.write_line(&sanitised, &[("machine", &record.machine), ("type", "serial")]) {
                warn!("Failed to write serial log line: {e:#}");
            }
        }
    }

    /// Open a `nest` element with a `head` child; the returned guard closes
    /// the scope (draining once more and emitting an elapsed-time trailer)
    /// when dropped. Scopes nest strictly LIFO via normal Rust drop order.
    pub fn nested<'a>(&'a self, msg: &str, attrs: Attrs<'_>) -> NestGuard<'a> {
        eprintln!("{}", Self::maybe_prefix(msg, attrs));

        {
            let mut writer = self.writer.lock().unwrap();
            if let Err(e) = writer.write_event(Event::Start(BytesStart::new("nest"))) {
                warn!("Failed to open <nest>: {e:#}");
            }
            if let Err(e) = writer
                .create_element("head")
                .with_attributes(attrs.iter().copied())
                .write_text_content(BytesText::new(msg))
            {
                warn!("Failed to write <head>: {e:#}");
            }
        }
        self.drain();

        NestGuard {
            logger: self,
            tic: Instant::now(),
        }
    }

    /// Flush, emit the closing `logfile` element, and release the backing
    /// file. Safe to call more than once.
    pub fn close(&self) {
        self.drain();
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writer.write_event(Event::End(BytesEnd::new("logfile"))) {
            warn!("Failed to close <logfile>: {e:#}");
        }
        if let Err(e) = writer.get_mut().flush() {
            warn!("Failed to flush log file: {e:#}");
        }
    }
}

/// RAII scope returned by [`Logger::nested`].
pub struct NestGuard<'a> {
    logger: &'a Logger,
    tic: Instant,
}

impl Drop for NestGuard<'_> {
    fn drop(&mut self) {
        self.logger.drain();
        let elapsed = self.tic.elapsed().as_secs_f64();
        self.logger.log(&format!("({elapsed:.2} seconds)"), &[]);

        let mut writer = self.logger.writer.lock().unwrap();
        if let Err(e) = writer.write_event(Event::End(BytesEnd::new("nest"))) {
            warn!("Failed to close <nest>: {e:#}");
        }
    }
}
