//! Register-map batches executed as a single worker task.
//!
//! A batch is assembled on the requesting thread from register-map rows, then
//! run on a worker under one device ticket. Every row that is read produces a
//! [`RowUpdate`] that is marshaled back to the requester as task progress, so the
//! map view can refresh row by row while the batch is still running.
//!
//! Group actions (a whole page or the whole map) skip rows that cannot be
//! meaningfully accessed: register rows with nothing filled in, register writes
//! without a value, and rows flagged as not idempotent for group access.

use crate::device::{Addr, DeviceError, SimulatedDevice, Word};
use crate::error::TaskError;
use crate::task::{ResultSink, TaskContext, TaskHandle, TaskRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

/// What a register-map row refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    /// A single register.
    Register,
    /// A FIFO port; reads pop words.
    Fifo,
    /// A memory window.
    Memory,
    /// A heading; not accessible.
    Section,
}

/// Words transferred by FIFO and memory rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    /// Register write issued before the block transfer, e.g. to select a bank.
    pub pre_write: Option<(Addr, Word)>,
    /// Words to write, or a buffer sized for the words to read.
    pub words: Vec<Word>,
}

/// One row of a register map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRow {
    /// What the row refers to.
    pub kind: RowKind,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Device address; `None` until filled in.
    pub addr: Option<Addr>,
    /// Register value; unused for blocks.
    pub data: Option<Word>,
    /// Block transfer data for FIFO and memory rows.
    #[serde(default)]
    pub block: BlockData,
    /// Leave out of page and map writes.
    #[serde(default)]
    pub skip_group_write: bool,
    /// Leave out of page and map reads.
    #[serde(default)]
    pub skip_group_read: bool,
}

impl RegisterRow {
    /// A register row with an address and, optionally, a value.
    pub fn register(name: impl Into<String>, addr: Addr, data: Option<Word>) -> Self {
        Self {
            kind: RowKind::Register,
            name: name.into(),
            addr: Some(addr),
            data,
            block: BlockData::default(),
            skip_group_write: false,
            skip_group_read: false,
        }
    }

    /// A FIFO or memory row transferring `words`.
    pub fn block(kind: RowKind, name: impl Into<String>, addr: Addr, words: Vec<Word>) -> Self {
        Self {
            kind,
            name: name.into(),
            addr: Some(addr),
            data: None,
            block: BlockData {
                pre_write: None,
                words,
            },
            skip_group_write: false,
            skip_group_read: false,
        }
    }

    fn is_blank_register(&self) -> bool {
        self.kind == RowKind::Register
            && self.name.is_empty()
            && self.addr.is_none()
            && self.data.is_none()
    }
}

/// Zero-based location of a row. Displayed one-based, as users count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowPosition {
    /// Page index.
    pub page: usize,
    /// Row index within the page.
    pub row: usize,
}

impl fmt::Display for RowPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}, row {}", self.page + 1, self.row + 1)
    }
}

/// Direction of a row access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Read the row's current contents from the device.
    Read,
    /// Write the row's value to the device.
    Write,
}

/// Scope of the user action a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTarget {
    /// A single selected row; group skip rules do not apply.
    Row,
    /// Every row of the current page.
    Page,
    /// Every row of every page.
    All,
}

/// A queued access to one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCommand {
    /// Read or write.
    pub kind: CommandKind,
    /// Scope of the action that queued it.
    pub target: ActionTarget,
    /// Where the row sits in the map.
    pub position: RowPosition,
    /// Snapshot of the row when it was queued.
    pub row: RegisterRow,
}

/// Fresh contents of a row after a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    /// Row that was read.
    pub position: RowPosition,
    /// Its contents with the data read from the device.
    pub row: RegisterRow,
}

/// Counters reported when a batch completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Rows read.
    pub reads: usize,
    /// Rows written.
    pub writes: usize,
    /// Rows left out by the group-action rules when the batch was built.
    pub skipped: usize,
}

/// Rows that cannot be turned into a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    /// Section headers have no device address.
    #[error("No register, FIFO or memory is selected ({0})")]
    NotAccessible(RowPosition),

    /// The row's value cannot be written.
    #[error("Invalid value ({0})")]
    InvalidValue(RowPosition),
}

/// Commands collected for one device task.
#[derive(Debug, Clone, Default)]
pub struct RegisterBatch {
    commands: Vec<RegisterCommand>,
    skipped: usize,
}

impl RegisterBatch {
    /// An empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an access to `row`.
    ///
    /// Returns `Ok(false)` if the group-action rules skip the row and an error if
    /// the row is not accessible at all.
    pub fn push(
        &mut self,
        kind: CommandKind,
        target: ActionTarget,
        position: RowPosition,
        row: &RegisterRow,
    ) -> Result<bool, BatchError> {
        if row.kind == RowKind::Section {
            return Err(BatchError::NotAccessible(position));
        }
        if target != ActionTarget::Row && Self::skipped_in_group(kind, row) {
            trace!(%position, ?kind, "row skipped by group action");
            self.skipped += 1;
            return Ok(false);
        }
        self.commands.push(RegisterCommand {
            kind,
            target,
            position,
            row: row.clone(),
        });
        Ok(true)
    }

    fn skipped_in_group(kind: CommandKind, row: &RegisterRow) -> bool {
        if row.kind == RowKind::Register {
            if row.is_blank_register() {
                return true;
            }
            if kind == CommandKind::Write && row.data.is_none() {
                return true;
            }
        }
        match kind {
            CommandKind::Write => row.skip_group_write,
            CommandKind::Read => row.skip_group_read,
        }
    }

    /// Commands in execution order.
    pub fn commands(&self) -> &[RegisterCommand] {
        &self.commands
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing was queued.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Operation label the device ticket is taken under.
    pub fn label(&self) -> &'static str {
        let writes = self.commands.iter().any(|c| c.kind == CommandKind::Write);
        let reads = self.commands.iter().any(|c| c.kind == CommandKind::Read);
        match (reads, writes) {
            (false, true) => "register map write",
            (true, false) => "register map read",
            _ => "register map access",
        }
    }

    /// Runs the batch on `device`, stopping at the first failing row.
    pub fn execute(
        &self,
        device: &SimulatedDevice,
        ctx: &TaskContext<BatchSummary, RowUpdate>,
    ) -> anyhow::Result<BatchSummary> {
        let mut summary = BatchSummary {
            skipped: self.skipped,
            ..BatchSummary::default()
        };
        for cmd in &self.commands {
            ctx.checkpoint()?;
            match cmd.kind {
                CommandKind::Write => {
                    write_row(device, cmd)?;
                    summary.writes += 1;
                }
                CommandKind::Read => {
                    let row = read_row(device, cmd)?;
                    summary.reads += 1;
                    // A cancelled batch must not touch the view any more.
                    if ctx.is_cancelled() {
                        continue;
                    }
                    ctx.report_progress(RowUpdate {
                        position: cmd.position,
                        row,
                    });
                }
            }
        }
        debug!(reads = summary.reads, writes = summary.writes, skipped = summary.skipped, "register batch done");
        Ok(summary)
    }

    /// Submits the batch as one task on `device`.
    pub fn submit(
        self,
        runner: &TaskRunner,
        device: SimulatedDevice,
        sink: ResultSink<BatchSummary, RowUpdate>,
    ) -> TaskHandle {
        let label = self.label();
        let id = device.id().clone();
        runner.submit_task(id, label, move |ctx| self.execute(&device, ctx), sink)
    }
}

fn device_error(position: RowPosition, err: DeviceError) -> TaskError {
    TaskError::Device(format!("{err} ({position})"))
}

fn write_row(device: &SimulatedDevice, cmd: &RegisterCommand) -> anyhow::Result<()> {
    let row = &cmd.row;
    let position = cmd.position;
    let addr = row.addr.ok_or(BatchError::InvalidValue(position))?;
    let result = match row.kind {
        RowKind::Register => {
            let value = row.data.ok_or(BatchError::InvalidValue(position))?;
            device.write_reg(addr, value)
        }
        RowKind::Fifo | RowKind::Memory => {
            let block = &row.block;
            let pre = match block.pre_write {
                Some((pre_addr, pre_value)) => device.write_reg(pre_addr, pre_value),
                None => Ok(()),
            };
            pre.and_then(|()| {
                if row.kind == RowKind::Fifo {
                    device.write_fifo(addr, &block.words)
                } else {
                    device.write_mem(addr, &block.words)
                }
            })
        }
        RowKind::Section => return Err(BatchError::NotAccessible(position).into()),
    };
    result.map_err(|err| device_error(position, err).into())
}

fn read_row(device: &SimulatedDevice, cmd: &RegisterCommand) -> anyhow::Result<RegisterRow> {
    let position = cmd.position;
    let mut row = cmd.row.clone();
    let addr = row.addr.ok_or(BatchError::InvalidValue(position))?;
    match row.kind {
        RowKind::Register => {
            row.data = Some(device.read_reg(addr).map_err(|err| device_error(position, err))?);
        }
        RowKind::Fifo | RowKind::Memory => {
            if let Some((pre_addr, pre_value)) = row.block.pre_write {
                device
                    .write_reg(pre_addr, pre_value)
                    .map_err(|err| device_error(position, err))?;
            }
            let len = row.block.words.len();
            let words = if row.kind == RowKind::Fifo {
                device.read_fifo(addr, len)
            } else {
                device.read_mem(addr, len)
            };
            row.block.words = words.map_err(|err| device_error(position, err))?;
        }
        RowKind::Section => return Err(BatchError::NotAccessible(position).into()),
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(page: usize, row: usize) -> RowPosition {
        RowPosition { page, row }
    }

    #[test]
    fn group_actions_skip_unusable_rows() {
        let mut batch = RegisterBatch::new();
        let blank = RegisterRow {
            name: String::new(),
            addr: None,
            ..RegisterRow::register("", 0, None)
        };
        let no_value = RegisterRow::register("ctrl", 0x10, None);
        let mut volatile = RegisterRow::register("irq_ack", 0x14, Some(1));
        volatile.skip_group_write = true;
        let good = RegisterRow::register("mode", 0x18, Some(3));

        assert_eq!(batch.push(CommandKind::Write, ActionTarget::Page, at(0, 0), &blank), Ok(false));
        assert_eq!(batch.push(CommandKind::Write, ActionTarget::Page, at(0, 1), &no_value), Ok(false));
        assert_eq!(batch.push(CommandKind::Write, ActionTarget::All, at(0, 2), &volatile), Ok(false));
        assert_eq!(batch.push(CommandKind::Write, ActionTarget::Page, at(0, 3), &good), Ok(true));
        // Single-row actions are never skipped.
        assert_eq!(batch.push(CommandKind::Write, ActionTarget::Row, at(0, 2), &volatile), Ok(true));
        // Reads of a register without a value are fine in a group.
        assert_eq!(batch.push(CommandKind::Read, ActionTarget::Page, at(0, 1), &no_value), Ok(true));

        assert_eq!(batch.len(), 3);
        assert_eq!(batch.skipped, 3);
        assert_eq!(batch.label(), "register map access");
    }

    #[test]
    fn sections_are_not_accessible() {
        let mut batch = RegisterBatch::new();
        let section = RegisterRow {
            kind: RowKind::Section,
            ..RegisterRow::register("Status", 0, None)
        };
        assert_eq!(
            batch.push(CommandKind::Read, ActionTarget::Row, at(1, 4), &section),
            Err(BatchError::NotAccessible(at(1, 4)))
        );
        assert!(batch.is_empty());
    }

    #[test]
    fn position_is_shown_one_based() {
        assert_eq!(at(0, 2).to_string(), "page 1, row 3");
        assert_eq!(
            device_error(at(0, 2), DeviceError::Fault { addr: 0x10 }).to_string(),
            "Device error: I/O fault at address 0x00000010 (page 1, row 3)"
        );
    }

    #[test]
    fn block_rows_apply_pre_write() {
        let device = SimulatedDevice::new("dev0");
        let mut row = RegisterRow::block(RowKind::Memory, "coeffs", 0x200, vec![5, 6, 7]);
        row.block.pre_write = Some((0x04, 2));
        let cmd = RegisterCommand {
            kind: CommandKind::Write,
            target: ActionTarget::Row,
            position: at(0, 0),
            row,
        };
        write_row(&device, &cmd).unwrap();
        assert_eq!(device.read_reg(0x04), Ok(2));
        assert_eq!(device.read_mem(0x200, 3), Ok(vec![5, 6, 7]));

        let read = RegisterCommand {
            kind: CommandKind::Read,
            row: RegisterRow::block(RowKind::Memory, "coeffs", 0x201, vec![0; 2]),
            ..cmd
        };
        assert_eq!(read_row(&device, &read).unwrap().block.words, vec![6, 7]);
    }

    #[test]
    fn register_write_without_address_is_invalid() {
        let device = SimulatedDevice::new("dev0");
        let cmd = RegisterCommand {
            kind: CommandKind::Write,
            target: ActionTarget::Row,
            position: at(2, 0),
            row: RegisterRow {
                addr: None,
                ..RegisterRow::register("ctrl", 0, Some(1))
            },
        };
        let err = write_row(&device, &cmd).unwrap_err();
        assert_eq!(
            err.downcast_ref::<BatchError>(),
            Some(&BatchError::InvalidValue(at(2, 0)))
        );
    }
}
