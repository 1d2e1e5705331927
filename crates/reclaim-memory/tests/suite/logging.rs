use reclaim_memory::ResourcePool;
use std::io;
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Default)]
struct SharedLogBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedLogBuffer {
    fn as_string(&self) -> String {
        let bytes = self.0.lock().expect("log buffer mutex poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedLogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self.0.lock().expect("log buffer mutex poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedLogBuffer {
    type Writer = SharedLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogWriter(self.0.clone())
    }
}

fn clear_pool_with_filter(directives: &str) -> String {
    let logs = SharedLogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .without_time()
        .with_env_filter(EnvFilter::new(directives))
        .with_writer(logs.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        let pool = ResourcePool::new("textures", 1_024);
        pool.store("a", 1u32, 10);
        pool.clear();
    });
    logs.as_string()
}

#[test]
fn memory_events_match_their_crate_target_directive() {
    let output = clear_pool_with_filter("warn,reclaim.memory=debug");
    assert!(output.contains("cleared pool"), "{output}");
    assert!(output.contains("reclaim.memory"), "{output}");
}

#[test]
fn crate_target_directive_can_silence_memory_events() {
    let output = clear_pool_with_filter("debug,reclaim.memory=warn");
    assert!(!output.contains("cleared pool"), "{output}");
}
