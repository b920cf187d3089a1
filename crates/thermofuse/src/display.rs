//! Display collaborators for the fusion loop.

use crossbeam_channel::{unbounded, Receiver};
use image::RgbImage;
use std::io::BufRead;

/// Key that ends the fusion loop.
pub const QUIT_KEY: char = 'q';

/// Named-window output plus a non-blocking key poll.
pub trait Display {
    fn show(&mut self, window: &str, image: &RgbImage);
    /// Most recent key press, if any arrived since the last poll.
    fn poll_key(&mut self) -> Option<char>;
}

/// Discards frames and never reports a key.
#[derive(Debug, Default)]
pub struct HeadlessDisplay;

impl Display for HeadlessDisplay {
    fn show(&mut self, _window: &str, _image: &RgbImage) {}

    fn poll_key(&mut self) -> Option<char> {
        None
    }
}

/// Console display: logs each window update and reads keys from stdin.
///
/// A line typed on stdin is delivered as its first character, so `q` then
/// Enter quits.
pub struct TerminalDisplay {
    keys: Receiver<char>,
    shown: u64,
}

impl TerminalDisplay {
    pub fn new() -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        // Detached: the thread stays blocked in read_line until stdin closes.
        std::thread::Builder::new()
            .name("stdin-keys".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let Ok(line) = line else { break };
                    if let Some(key) = line.trim().chars().next() {
                        if tx.send(key).is_err() {
                            break;
                        }
                    }
                }
            })?;
        tracing::info!("press '{QUIT_KEY}' then Enter to quit");
        Ok(Self { keys: rx, shown: 0 })
    }
}

impl Display for TerminalDisplay {
    fn show(&mut self, window: &str, image: &RgbImage) {
        self.shown += 1;
        tracing::debug!(window, width = image.width(), height = image.height(), shown = self.shown, "show");
    }

    fn poll_key(&mut self) -> Option<char> {
        self.keys.try_iter().last()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Records every `show` call and replays scripted keys, one per poll.
    #[derive(Default)]
    pub(crate) struct RecordingDisplay {
        pub shows: Arc<Mutex<Vec<(String, (u32, u32), Instant)>>>,
        pub keys: VecDeque<Option<char>>,
    }

    impl Display for RecordingDisplay {
        fn show(&mut self, window: &str, image: &RgbImage) {
            self.shows
                .lock()
                .unwrap()
                .push((window.to_string(), image.dimensions(), Instant::now()));
        }

        fn poll_key(&mut self) -> Option<char> {
            self.keys.pop_front().flatten()
        }
    }

    #[test]
    fn test_headless_never_quits() {
        let mut display = HeadlessDisplay;
        display.show("RGB", &RgbImage::new(2, 2));
        assert_eq!(display.poll_key(), None);
    }

    #[test]
    fn test_recording_display_replays_keys() {
        let mut display = RecordingDisplay {
            keys: VecDeque::from([None, Some(QUIT_KEY)]),
            ..Default::default()
        };
        display.show("IR", &RgbImage::new(3, 2));
        assert_eq!(display.poll_key(), None);
        assert_eq!(display.poll_key(), Some('q'));
        assert_eq!(display.poll_key(), None);
        assert_eq!(display.shows.lock().unwrap()[0].1, (3, 2));
    }
}
