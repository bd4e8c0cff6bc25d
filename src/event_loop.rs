use std::io::Error;

use anyhow::{Context, Result};

use crate::reader::{LoopRequest, PolledReader, ReaderStatus, Session};

type ReaderFactory = Box<dyn FnMut() -> Box<dyn PolledReader>>;

/// Polls every registered reader and dispatches the ready ones until one of
/// them quits or fails. Readers are stopped in reverse registration order
/// however the loop ends.
pub struct EventLoop {
    readers: Vec<Box<dyn PolledReader>>,
    session: Session,
    on_producer_ready: Option<ReaderFactory>,
}

impl EventLoop {
    pub fn new(session: Session) -> Self {
        EventLoop {
            readers: Vec::new(),
            session,
            on_producer_ready: None,
        }
    }

    /// Reader to start once the event producer reports it is running.
    pub fn on_producer_ready<F>(&mut self, factory: F)
    where
        F: FnMut() -> Box<dyn PolledReader> + 'static,
    {
        self.on_producer_ready = Some(Box::new(factory));
    }

    /// Start a reader and add it to the poll set. A reader that fails to
    /// start is stopped and not registered.
    pub fn start_reader(&mut self, mut reader: Box<dyn PolledReader>) -> Result<()> {
        if let Err(e) = reader.start() {
            reader.stop();
            return Err(e).with_context(|| format!("Failed to start {} reader", reader.name()));
        }
        tracing::debug!("Started {} reader", reader.name());
        self.readers.push(reader);
        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Run until a reader quits (Ok) or fails (Err), then stop every reader.
    pub fn run(&mut self) -> Result<()> {
        let res = self.dispatch();
        self.shutdown();
        res
    }

    pub fn shutdown(&mut self) {
        while let Some(mut reader) = self.readers.pop() {
            tracing::debug!("Stopping {} reader", reader.name());
            reader.stop();
        }
    }

    fn handle_requests(&mut self) -> Result<()> {
        for request in self.session.take_requests() {
            match request {
                LoopRequest::ProducerReady => match self.on_producer_ready.as_mut() {
                    Some(factory) => {
                        let reader = factory();
                        self.start_reader(reader)?;
                    }
                    None => tracing::debug!("Producer ready, nothing to start"),
                },
            }
        }
        Ok(())
    }

    fn dispatch(&mut self) -> Result<()> {
        loop {
            if self.readers.is_empty() {
                tracing::warn!("No readers left to poll");
                return Ok(());
            }
            let mut fds: Vec<libc::pollfd> = self
                .readers
                .iter()
                .map(|reader| libc::pollfd {
                    fd: reader.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();
            let timeout = if self.readers.iter().any(|r| r.pending()) {
                0
            } else {
                -1
            };

            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
            if ret < 0 {
                let err = Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("poll failed");
            }

            for (i, pfd) in fds.iter().enumerate() {
                let reader = &mut self.readers[i];
                if pfd.revents == 0 && !reader.pending() {
                    continue;
                }
                if pfd.revents & libc::POLLNVAL != 0 {
                    anyhow::bail!("{} reader has an invalid descriptor", reader.name());
                }
                let status = reader
                    .handle_ready(&mut self.session)
                    .with_context(|| format!("{} reader failed", reader.name()))?;
                self.handle_requests()?;
                if status == ReaderStatus::Quit {
                    tracing::info!("{} reader requested exit", self.readers[i].name());
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
