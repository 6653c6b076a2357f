//! In-memory frame transport.
//!
//! Stands in for the capture channel in tests and simulations: whatever
//! one side injects shows up at the other side's source, frame for frame.
//! Dropping either half closes the link, which surfaces to readers the
//! same way a closed capture handle does.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use wire_types::frame::LinkKind;

use crate::capture::{FrameSink, FrameSource};
use crate::error::{GuiseError, Result};

/// Poll interval for the blocking source side.
const POLL_TICK: Duration = Duration::from_millis(5);

pub struct PipeSource {
    rx: Receiver<Vec<u8>>,
    link: LinkKind,
}

impl FrameSource for PipeSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(POLL_TICK) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(GuiseError::Closed),
        }
    }

    fn link(&self) -> LinkKind {
        self.link
    }
}

#[derive(Clone)]
pub struct PipeSink {
    tx: Sender<Vec<u8>>,
}

impl FrameSink for PipeSink {
    fn inject(&mut self, frame: &[u8]) -> Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| GuiseError::Closed)
    }
}

/// One directed hop: frames written to the sink come out of the source.
pub fn hop(link: LinkKind) -> (PipeSink, PipeSource) {
    let (tx, rx) = channel();
    (PipeSink { tx }, PipeSource { rx, link })
}

/// A source/sink pair belonging to one endpoint of a link.
pub struct PipeEnd {
    pub source: PipeSource,
    pub sink: PipeSink,
}

/// Two endpoints wired back to back.
pub fn pair(link: LinkKind) -> (PipeEnd, PipeEnd) {
    let (a_tx, b_rx) = hop(link);
    let (b_tx, a_rx) = hop(link);
    (
        PipeEnd {
            source: a_rx,
            sink: a_tx,
        },
        PipeEnd {
            source: b_rx,
            sink: b_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cross_the_pair() {
        let (mut a, mut b) = pair(LinkKind::Loopback);
        a.sink.inject(b"one").unwrap();
        a.sink.inject(b"two").unwrap();
        assert_eq!(b.source.next_frame().unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(b.source.next_frame().unwrap().as_deref(), Some(&b"two"[..]));
        b.sink.inject(b"back").unwrap();
        assert_eq!(
            a.source.next_frame().unwrap().as_deref(),
            Some(&b"back"[..])
        );
    }

    #[test]
    fn empty_link_ticks() {
        let (_a, mut b) = pair(LinkKind::Loopback);
        assert_eq!(b.source.next_frame().unwrap(), None);
    }

    #[test]
    fn dropped_peer_closes_the_source() {
        let (a, mut b) = pair(LinkKind::Loopback);
        drop(a);
        loop {
            match b.source.next_frame() {
                Ok(Some(_)) => continue,
                Ok(None) => continue,
                Err(e) => {
                    assert!(matches!(e, GuiseError::Closed));
                    break;
                }
            }
        }
    }
}
