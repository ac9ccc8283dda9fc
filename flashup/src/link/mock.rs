//! Scripted in-memory link for transport tests.

use crate::error::{Error, Result};
use crate::link::Link;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Shared handle onto a [`MockLink`]'s state, letting a test keep feeding
/// inbound bytes and inspecting writes after the link has been moved into a
/// transport.
#[derive(Clone, Default)]
pub struct MockHandle {
    inner: Rc<RefCell<MockState>>,
}

#[derive(Default)]
struct MockState {
    inbound: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    open: bool,
    fail_open: bool,
    fail_writes: bool,
    read_error: bool,
}

impl MockHandle {
    /// Queue bytes to be returned by a future `read_available` call.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.inner.borrow_mut().inbound.push_back(bytes.to_vec());
    }

    /// All bytes written to the link so far.
    pub fn written(&self) -> Vec<u8> {
        self.inner.borrow().written.clone()
    }

    /// Forget previously captured writes.
    pub fn clear_written(&self) {
        self.inner.borrow_mut().written.clear();
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().open
    }

    /// Make the next `open` call fail.
    pub fn fail_open(&self) {
        self.inner.borrow_mut().fail_open = true;
    }

    /// Make write calls fail from now on.
    pub fn fail_writes(&self) {
        self.inner.borrow_mut().fail_writes = true;
    }

    /// Make the next read report a broken link (peer hangup).
    pub fn break_link(&self) {
        self.inner.borrow_mut().read_error = true;
    }
}

/// Test double implementing [`Link`] against scripted I/O.
pub struct MockLink {
    handle: MockHandle,
}

impl MockLink {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl Link for MockLink {
    fn open(&mut self) -> Result<()> {
        let mut state = self.handle.inner.borrow_mut();
        if state.fail_open {
            return Err(Error::ConnectFailed("mock open failure".into()));
        }
        state.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.inner.borrow().open
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.handle.inner.borrow_mut();
        if state.read_error {
            state.read_error = false;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        let Some(chunk) = state.inbound.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            state.inbound.push_front(chunk[n..].to_vec());
        }
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut state = self.handle.inner.borrow_mut();
        if state.fail_writes {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock write failure",
            )));
        }
        state.written.extend_from_slice(buf);
        Ok(())
    }

    fn close(&mut self) {
        self.handle.inner.borrow_mut().open = false;
    }

    fn endpoint(&self) -> &str {
        "mock"
    }
}
