//! Scripted compiler image for tests.
//!
//! The source text drives the fake compiler, one directive per line:
//!
//! - `info: <text>` / `error: <text>` emit a line on that stream
//! - `sleep: <ms>` blocks the invocation
//! - `exit: <code>` sets the exit code
//! - `no-output` skips writing the artifact
//! - `syntax-error` reports a parser error and exits 1 without output
//! - `panic` crashes the isolate running the invocation
//!
//! Anything else is treated as CAD source and ignored.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{LoadError, ProvisionError};
use crate::image::{CompilerImage, ImageInfo, ImageSource};
use crate::sandbox::fonts::FontSet;
use crate::sandbox::{EntryPoint, OutputSink, SandboxEnv, StreamKind};

/// Fake compiler image whose behavior is read from the source text.
#[derive(Debug, Default)]
pub struct ScriptedImage {
    fonts: FontSet,
    failing_instantiations: AtomicUsize,
    instantiations: Arc<AtomicUsize>,
    invocations: Arc<AtomicUsize>,
}

impl ScriptedImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` instantiations.
    pub fn fail_instantiations(self, n: usize) -> Self {
        self.failing_instantiations.store(n, Ordering::SeqCst);
        self
    }

    pub fn instantiations(&self) -> usize {
        self.instantiations.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl CompilerImage for ScriptedImage {
    fn info(&self) -> ImageInfo {
        ImageInfo {
            path: None,
            digest: "scripted".to_string(),
            size: 0,
            font_dir: None,
        }
    }

    fn fonts(&self) -> &FontSet {
        &self.fonts
    }

    fn instantiate(&self, _env: &SandboxEnv) -> Result<Box<dyn EntryPoint>, ProvisionError> {
        let failing = self
            .failing_instantiations
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProvisionError::Entrypoint(
                "scripted instantiation failure".to_string(),
            ));
        }
        self.instantiations.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEntry {
            invocations: Arc::clone(&self.invocations),
        }))
    }
}

/// Entry point of [`ScriptedImage`].
struct ScriptedEntry {
    invocations: Arc<AtomicUsize>,
}

impl EntryPoint for ScriptedEntry {
    fn call_main(self: Box<Self>, env: &SandboxEnv, args: &[String], sink: &dyn OutputSink) -> i32 {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let input = args.first().map(|a| env.root.join(a));
        let output = args.get(2).map(|a| env.root.join(a));
        let flag = args.get(4).cloned().unwrap_or_default();
        let Some(source) = input.and_then(|p| fs::read_to_string(p).ok()) else {
            sink.emit(StreamKind::Error, "ERROR: Can't open input file");
            return 1;
        };

        let mut exit_code = 0;
        let mut write_output = true;
        for line in source.lines() {
            let line = line.trim();
            if let Some(text) = line.strip_prefix("info:") {
                sink.emit(StreamKind::Info, text.trim());
            } else if let Some(text) = line.strip_prefix("error:") {
                sink.emit(StreamKind::Error, text.trim());
            } else if let Some(ms) = line.strip_prefix("sleep:") {
                let ms = ms.trim().parse().unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
            } else if let Some(code) = line.strip_prefix("exit:") {
                exit_code = code.trim().parse().unwrap_or(1);
            } else if line == "no-output" {
                write_output = false;
            } else if line == "panic" {
                panic!("scripted compiler crash");
            } else if line == "syntax-error" {
                sink.emit(
                    StreamKind::Error,
                    "ERROR: Parser error in file \"input.scad\", line 1: syntax error",
                );
                sink.emit(StreamKind::Error, "Execution aborted");
                exit_code = 1;
                write_output = false;
            }
        }

        if write_output && let Some(path) = output {
            let artifact = format!("solid scadbox {} {}\n", flag, source.len());
            if fs::write(path, artifact).is_err() {
                return 1;
            }
        }
        exit_code
    }
}

/// Image source handing out one shared [`ScriptedImage`].
pub struct ScriptedSource {
    image: Arc<ScriptedImage>,
    fetches: AtomicUsize,
    failing_fetches: AtomicUsize,
    delay: Duration,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        Self::with_image(Arc::new(ScriptedImage::new()))
    }
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(image: Arc<ScriptedImage>) -> Self {
        Self {
            image,
            fetches: AtomicUsize::new(0),
            failing_fetches: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Fail the next `n` fetches.
    pub fn fail_fetches(self, n: usize) -> Self {
        self.failing_fetches.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_fetch_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl ImageSource for ScriptedSource {
    fn fetch(&self) -> Result<Arc<dyn CompilerImage>, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let failing = self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LoadError::Instantiate("scripted fetch failure".to_string()));
        }
        Ok(self.image.clone())
    }
}
