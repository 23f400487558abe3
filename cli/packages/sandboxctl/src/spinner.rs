use std::io::{IsTerminal, Write};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

const FRAMES: &[&str] = &[".  ", ".. ", "..."];
const FRAME_INTERVAL: Duration = Duration::from_millis(300);

/// Progress indicator drawn on stderr from its own thread while a blocking
/// call runs. Dropping it stops the thread and leaves `"<message>..."` on the
/// line.
pub(crate) struct Spinner {
    message: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Spinner {
    pub(crate) fn start(message: &str) -> Self {
        let message = message.to_string();
        if !std::io::stderr().is_terminal() {
            return Self {
                message,
                stop: None,
                handle: None,
            };
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let prefix = message.clone();
        let handle = std::thread::spawn(move || {
            let mut frame = 0usize;
            loop {
                let mut err = std::io::stderr();
                let _ = write!(err, "\r{}{}", prefix, FRAMES[frame % FRAMES.len()]);
                let _ = err.flush();
                frame += 1;
                match stopped.recv_timeout(FRAME_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Self {
            message,
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread immediately.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            let mut err = std::io::stderr();
            let _ = writeln!(err, "\r{}...", self.message);
            let _ = err.flush();
        }
    }
}
