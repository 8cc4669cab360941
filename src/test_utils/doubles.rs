//! Scripted stand-ins for the camera's sockets

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use crate::net::{CommandSink, DatagramSource, Received};
use crate::protocol::Command;

/// Replays a fixed script of receive outcomes
///
/// Once the script runs out the source reports [`Received::Exhausted`], or
/// [`Received::WouldBlock`] forever when built with
/// [`ScriptedSource::endless_would_block`].
#[derive(Debug, Default)]
pub struct ScriptedSource {
    script: VecDeque<io::Result<Received>>,
    datagrams: VecDeque<Vec<u8>>,
    block_when_empty: bool,
}

impl ScriptedSource {
    /// A source that never yields anything
    pub fn endless_would_block() -> Self {
        Self {
            block_when_empty: true,
            ..Default::default()
        }
    }

    /// A source yielding `datagrams` in order, then exhausted
    pub fn from_datagrams<I>(datagrams: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let mut source = Self::default();
        for datagram in datagrams {
            source.push_datagram(datagram);
        }
        source
    }

    /// Queue a datagram
    pub fn push_datagram(&mut self, datagram: Vec<u8>) {
        self.script.push_back(Ok(Received::Datagram(datagram.len())));
        self.datagrams.push_back(datagram);
    }

    /// Queue a raw outcome; a `Datagram` entry here must be paired with
    /// [`ScriptedSource::push_datagram`] instead
    pub fn push(&mut self, outcome: io::Result<Received>) {
        self.script.push_back(outcome);
    }

    /// Number of outcomes still queued
    pub fn remaining(&self) -> usize {
        self.script.len()
    }
}

impl DatagramSource for ScriptedSource {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        match self.script.pop_front() {
            Some(Ok(Received::Datagram(_))) => {
                let datagram = self.datagrams.pop_front().unwrap_or_default();
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(Received::Datagram(len))
            }
            Some(outcome) => outcome,
            None if self.block_when_empty => Ok(Received::WouldBlock),
            None => Ok(Received::Exhausted),
        }
    }
}

/// Records every command sent; clones share the log
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    log: Arc<Mutex<Vec<Command>>>,
}

impl RecordingSink {
    /// Shared handle to the command log, usable after the sink moves away
    pub fn handle(&self) -> Arc<Mutex<Vec<Command>>> {
        Arc::clone(&self.log)
    }

    /// Commands sent so far
    pub fn commands(&self) -> Vec<Command> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// How many times `command` was sent
    pub fn count(&self, command: Command) -> usize {
        self.commands().iter().filter(|&&c| c == command).count()
    }
}

impl CommandSink for RecordingSink {
    fn send_command(&mut self, command: Command) -> io::Result<()> {
        self.log
            .lock()
            .map_err(|_| io::Error::other("command log poisoned"))?
            .push(command);
        Ok(())
    }
}
