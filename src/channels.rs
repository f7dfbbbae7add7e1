//! Bulk access to channel ranges spanning several chained modules.
//!
//! Channels are numbered globally along the daisy chain. A write to a
//! range is split into one vector command per covered module. Reads fetch
//! whole modules (or the whole chain, in text mode) and slice the result
//! back into the order requested.

use std::ops::Range;

use crate::command::{AddressingMode, BinaryCommand, Command, HeaderFlags};
use crate::error::{QontrolError, Result};
use crate::protocol::{IssueOptions, Qontroller, NUMBER_REGEX};
use crate::types::{ModuleInfo, Payload, Value};

/// Part of a channel range that falls on one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpan {
    /// Position of the module on the chain
    pub module: usize,
    /// All channels of the module
    pub block: Range<usize>,
    /// Requested channels on the module
    pub part: Range<usize>,
}

/// Global channel layout of a daisy chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMap {
    blocks: Vec<Range<usize>>,
}

impl ChannelMap {
    /// Layout from discovered modules, in chain order.
    ///
    /// Modules whose channel count is unknown contribute no channels.
    pub fn from_chain(chain: &[ModuleInfo]) -> Self {
        let mut ordered: Vec<&ModuleInfo> = chain.iter().collect();
        ordered.sort_by_key(|m| m.index.unwrap_or(usize::MAX));
        Self::from_counts(ordered.iter().map(|m| m.n_chs))
    }

    /// Layout from per-module channel counts, in chain order
    pub fn from_counts(counts: impl IntoIterator<Item = usize>) -> Self {
        let mut start = 0;
        let blocks = counts
            .into_iter()
            .map(|n| {
                let block = start..start + n;
                start += n;
                block
            })
            .collect();
        ChannelMap { blocks }
    }

    pub fn n_modules(&self) -> usize {
        self.blocks.len()
    }

    pub fn n_channels(&self) -> usize {
        self.blocks.last().map_or(0, |b| b.end)
    }

    /// Split `range` into the parts covered by each module, in module order.
    pub fn split(&self, range: &Range<usize>) -> Result<Vec<Range<usize>>> {
        Ok(self.spans(range)?.into_iter().map(|s| s.part).collect())
    }

    /// Like [`split`](Self::split), keeping track of the module of each part.
    pub fn spans(&self, range: &Range<usize>) -> Result<Vec<ModuleSpan>> {
        let total = self.n_channels();
        if range.start >= range.end || range.end > total {
            return Err(QontrolError::InvalidChannel {
                channel: range.end.saturating_sub(1) as u32,
                max: total.saturating_sub(1) as u32,
            });
        }

        Ok(self
            .blocks
            .iter()
            .enumerate()
            .map(|(module, block)| ModuleSpan {
                module,
                block: block.clone(),
                part: block.start.max(range.start)..block.end.min(range.end),
            })
            .filter(|s| s.part.start < s.part.end)
            .collect())
    }
}

/// Values for a channel range: one for every channel, or one per channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValues {
    Uniform(f64),
    PerChannel(Vec<f64>),
}

impl ChannelValues {
    fn expand(&self, len: usize) -> Result<Vec<f64>> {
        match self {
            ChannelValues::Uniform(v) => Ok(vec![*v; len]),
            ChannelValues::PerChannel(vs) if vs.len() == len => Ok(vs.clone()),
            ChannelValues::PerChannel(vs) => Err(QontrolError::InvalidValue(format!(
                "{} values given for {len} channels",
                vs.len()
            ))),
        }
    }
}

impl From<f64> for ChannelValues {
    fn from(v: f64) -> Self {
        ChannelValues::Uniform(v)
    }
}

impl From<Vec<f64>> for ChannelValues {
    fn from(vs: Vec<f64>) -> Self {
        ChannelValues::PerChannel(vs)
    }
}

impl Qontroller {
    /// Total number of channels on the chain
    pub fn n_channels(&self) -> usize {
        self.channel_map().n_channels()
    }

    /// Set `command_id` on every channel of `range`.
    ///
    /// Sends one `<id>vec<first>=<v>,...` command per covered module.
    pub fn set_channels(
        &mut self,
        command_id: &str,
        range: Range<usize>,
        values: impl Into<ChannelValues>,
    ) -> Result<()> {
        let values = values.into().expand(range.len())?;
        let parts = self.channel_map().split(&range)?;

        for part in parts {
            let slice = values[part.start - range.start..part.end - range.start].to_vec();
            let command = Command::set(format!("{command_id}vec"), Value::Vector(slice))
                .channel(part.start as u32);
            self.issue_command(&command, &IssueOptions::new())?;
        }
        Ok(())
    }

    /// Binary counterpart of [`set_channels`](Self::set_channels): one
    /// extended-data write of raw words per covered module.
    pub fn set_channels_binary(
        &mut self,
        index: u8,
        range: Range<usize>,
        words: Vec<i64>,
    ) -> Result<()> {
        if words.len() != range.len() {
            return Err(QontrolError::InvalidValue(format!(
                "{} values given for {} channels",
                words.len(),
                range.len()
            )));
        }
        let parts = self.channel_map().split(&range)?;

        for part in parts {
            let slice = words[part.start - range.start..part.end - range.start].to_vec();
            let command = BinaryCommand::new(index)
                .flags(HeaderFlags::DEXT)
                .channel(part.start as u32)
                .values(slice);
            self.issue_binary_command(&command, &IssueOptions::new())?;
        }
        Ok(())
    }

    fn bulk_read_options(&self, n_lines: usize) -> Result<IssueOptions> {
        Ok(IssueOptions::new()
            .lines(n_lines)
            .output_regex(NUMBER_REGEX)?
            .timeout(2 * self.response_timeout()))
    }

    /// Read `command_id` from every channel on the chain with one
    /// `<id>all?` query.
    pub fn get_all_channels(&mut self, command_id: &str) -> Result<Vec<f64>> {
        let n = self.n_channels();
        self.get_channels(command_id, 0..n)
    }

    /// Read `command_id` from every channel of `range`, in channel order.
    pub fn get_channels(&mut self, command_id: &str, range: Range<usize>) -> Result<Vec<f64>> {
        self.channel_map().split(&range)?;
        let options = self.bulk_read_options(self.n_channels())?;

        let command = Command::get(format!("{command_id}all"));
        let values = to_values(&self.issue_command(&command, &options)?)?;
        slice_reply(&values, range)
    }

    /// Binary counterpart of [`get_channels`](Self::get_channels): one
    /// all-channel read per covered module, addressed by chain position.
    pub fn get_channels_binary(&mut self, index: u8, range: Range<usize>) -> Result<Vec<f64>> {
        let spans = self.channel_map().spans(&range)?;

        let mut values = Vec::with_capacity(range.len());
        for span in spans {
            let device_id = u16::try_from(span.module).map_err(|_| {
                QontrolError::InvalidValue(format!("module {} cannot be addressed", span.module))
            })?;
            let command = BinaryCommand::new(index)
                .read()
                .flags(HeaderFlags::ALLCH)
                .addressing(AddressingMode::DeviceWise { device_id });
            let options = self.bulk_read_options(span.block.len())?;

            let module_values = to_values(&self.issue_binary_command(&command, &options)?)?;
            let offset = span.block.start;
            values.extend(slice_reply(
                &module_values,
                span.part.start - offset..span.part.end - offset,
            )?);
        }
        Ok(values)
    }
}

fn to_values(replies: &[Payload]) -> Result<Vec<f64>> {
    replies.iter().map(Payload::as_f64).collect()
}

fn slice_reply(values: &[f64], range: Range<usize>) -> Result<Vec<f64>> {
    let n = values.len();
    values
        .get(range)
        .map(<[f64]>::to_vec)
        .ok_or_else(|| QontrolError::Parse(format!("bulk read returned only {n} values")))
}
