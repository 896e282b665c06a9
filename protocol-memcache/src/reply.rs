//! Typed replies assembled from parsed frames.

use std::collections::BTreeMap;

use crate::command::CommandKind;
use crate::error::ReplyError;
use crate::request::StatsGroup;
use crate::response::{CacheItem, ClusterConfig, Entry, Frame, Item, StatValue, Status, Version};

/// Flat `STAT` listing keyed by stat name.
pub type StatsMap = BTreeMap<String, StatValue>;

/// `stats slabs` / `stats items` output split by slab class.
///
/// A stat named `a:b:name` lands in group `a:b` under `name` (with a leading
/// `items:` dropped). Names without a colon are totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupedStats {
    pub groups: BTreeMap<String, StatsMap>,
    pub totals: StatsMap,
}

impl GroupedStats {
    fn insert(&mut self, name: String, value: StatValue) {
        let name = name.strip_prefix("items:").map(str::to_owned).unwrap_or(name);
        match name.rsplit_once(':') {
            Some((group, stat)) => {
                self.groups
                    .entry(group.to_owned())
                    .or_default()
                    .insert(stat.to_owned(), value);
            }
            None => {
                self.totals.insert(name, value);
            }
        }
    }
}

/// The result of one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Storage, delete, touch and flush outcomes.
    Done(bool),
    /// incr/decr result; `None` when the key does not exist.
    Numeric(Option<u64>),
    Value(Option<Item>),
    Values(Vec<Item>),
    Stats(StatsMap),
    Grouped(GroupedStats),
    Items(Vec<CacheItem>),
    Version(Version),
    Config(ClusterConfig),
}

impl Reply {
    /// Interpret `frame` as the reply to a command of `kind`.
    pub fn assemble(kind: CommandKind, frame: Frame) -> Result<Reply, ReplyError> {
        let unexpected = || ReplyError::Unexpected(kind.name());

        match (kind, frame) {
            (CommandKind::Get, Frame::Batch(entries)) => {
                Ok(Reply::Value(values(entries).into_iter().next()))
            }
            (CommandKind::GetMulti | CommandKind::Gets, Frame::Batch(entries)) => {
                Ok(Reply::Values(values(entries)))
            }
            (CommandKind::Store | CommandKind::Cas, Frame::Status(status)) => match status {
                Status::Stored => Ok(Reply::Done(true)),
                Status::NotStored | Status::Exists | Status::NotFound => Ok(Reply::Done(false)),
                _ => Err(unexpected()),
            },
            (CommandKind::Delete, Frame::Status(status)) => match status {
                Status::Deleted => Ok(Reply::Done(true)),
                Status::NotFound => Ok(Reply::Done(false)),
                _ => Err(unexpected()),
            },
            (CommandKind::Touch, Frame::Status(status)) => match status {
                Status::Touched => Ok(Reply::Done(true)),
                Status::NotFound => Ok(Reply::Done(false)),
                _ => Err(unexpected()),
            },
            (CommandKind::FlushAll, Frame::Status(Status::Ok)) => Ok(Reply::Done(true)),
            (CommandKind::Arithmetic, Frame::Numeric(n)) => Ok(Reply::Numeric(Some(n))),
            (CommandKind::Arithmetic, Frame::Status(Status::NotFound)) => Ok(Reply::Numeric(None)),
            (CommandKind::Stats(group), Frame::Batch(entries)) => {
                let stats = entries.into_iter().filter_map(|entry| match entry {
                    Entry::Stat(name, value) => Some((name, value)),
                    _ => None,
                });
                match group {
                    StatsGroup::General | StatsGroup::Settings => Ok(Reply::Stats(stats.collect())),
                    StatsGroup::Slabs | StatsGroup::Items => {
                        let mut grouped = GroupedStats::default();
                        for (name, value) in stats {
                            grouped.insert(name, value);
                        }
                        Ok(Reply::Grouped(grouped))
                    }
                }
            }
            (CommandKind::Cachedump, Frame::Batch(entries)) => Ok(Reply::Items(
                entries
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Entry::Item(item) => Some(item),
                        _ => None,
                    })
                    .collect(),
            )),
            (CommandKind::Version, Frame::Version(version)) => Ok(Reply::Version(version)),
            (CommandKind::Config, Frame::Batch(entries)) => entries
                .into_iter()
                .find_map(|entry| match entry {
                    Entry::Config(config) => Some(Reply::Config(config)),
                    _ => None,
                })
                .ok_or_else(unexpected),
            _ => Err(unexpected()),
        }
    }
}

fn values(entries: Vec<Entry>) -> Vec<Item> {
    entries
        .into_iter()
        .filter_map(|entry| match entry {
            Entry::Value(item) => Some(item),
            _ => None,
        })
        .collect()
}
