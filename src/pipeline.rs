//! Commands connected stdout-to-stdin

use std::fmt;

use log::debug;

use crate::command::Command;
use crate::directive::{Direction, Redirect};
use crate::errors::{PlumbError, Result};
use crate::execution::{ExitStatus, PipeWrapper, PostFork};
use crate::runner::RunState;

/// One or more commands, each stage's stdout feeding the next one's stdin.
///
/// The pipeline's status is its last stage's status.
#[derive(Debug, Clone)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new(commands: Vec<Command>) -> Result<Self> {
        if commands.is_empty() {
            return Err(PlumbError::Configuration(
                "A pipeline needs at least one command".to_string(),
            ));
        }
        Ok(Self::from_stages(commands))
    }

    pub(crate) fn from_stages(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Append a stage: `self | other`
    pub fn pipe(mut self, other: Command) -> Pipeline {
        self.commands.push(other);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn render(&self) -> String {
        self.commands
            .iter()
            .map(Command::render)
            .collect::<Vec<_>>()
            .join(" | ")
    }

    pub(crate) fn prepare(&self, run: &mut RunState) -> Result<()> {
        for command in &self.commands {
            command.prepare(run)?;
        }
        Ok(())
    }

    /// Start every stage left to right.
    ///
    /// A boundary's pipe is closed in the parent as soon as both stages
    /// on either side of it have forked, so at most two pipes are open
    /// here at any time.
    pub(crate) fn start(&self, run: &mut RunState) -> Result<()> {
        let mut previous: Option<PipeWrapper> = None;

        for pair in self.commands.windows(2) {
            let (left, right) = (&pair[0], &pair[1]);
            let pipe = PipeWrapper::new()?;
            let reader = pipe.reader_fd()?;
            let writer = pipe.writer_fd()?;

            left.add_directive(run, Redirect::fd(1, Direction::Write, writer).into());
            left.add_post_fork(run, PostFork::Close(reader));
            right.add_directive(run, Redirect::fd(0, Direction::Read, reader).into());
            right.add_post_fork(run, PostFork::Close(writer));

            left.start(run)?;
            if let Some(mut done) = previous.take() {
                done.close();
            }
            previous = Some(pipe);
        }

        if let Some(last) = self.commands.last() {
            last.start(run)?;
        }
        if let Some(mut done) = previous.take() {
            done.close();
        }

        debug!("Started pipeline of {} stages", self.commands.len());
        Ok(())
    }

    /// Reap every stage in order
    pub(crate) fn wait(&self, run: &mut RunState) -> Result<Option<ExitStatus>> {
        let mut status = None;
        for command in &self.commands {
            status = command.wait(run)?;
        }
        Ok(status)
    }

    pub(crate) fn status(&self, run: &RunState) -> Option<ExitStatus> {
        self.commands.last().and_then(|command| command.status(run))
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pipeline: {}", self.render())
    }
}
