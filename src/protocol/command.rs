//! Command codes and wire ordinals.
//!
//! Commands are serialized over the connection as a u32 big-endian code
//! right after the frame length prefix. The code values are fixed by the
//! engine and must never change; gaps in the numbering are codes the engine
//! reserves for operations not exposed over IPC.

/// A command understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    Initialize = 0,
    LoadCatalog = 2,
    Tick = 4,
    GetStats = 5,
    QueryPlanFragments = 6,
    PlanFragment = 7,
    LoadTable = 9,
    ReleaseUndoToken = 10,
    UndoUndoToken = 11,
    CustomPlanFragment = 12,
    SetLogLevels = 13,
    Quiesce = 16,
    ActivateTableStream = 17,
    TableStreamSerializeMore = 18,
    UpdateCatalog = 19,
    ExportAction = 20,
    RecoveryMessage = 21,
    TableHashCode = 22,
    Hashinate = 23,
}

impl Command {
    /// The wire code for this command.
    #[inline]
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Selector for the statistics a [`GetStats`](Command::GetStats) request
/// targets. Serialized as its wire ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatsSelector {
    Table = 0,
    Index = 1,
    Procedure = 2,
    Initiator = 3,
    IoStats = 4,
    Memory = 5,
}

impl StatsSelector {
    /// The wire ordinal for this selector.
    #[inline]
    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

/// Kind of table stream activated on the engine. Serialized as its wire
/// ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TableStreamType {
    /// Snapshot scan of a table's committed contents.
    Snapshot = 0,
    /// Recovery stream feeding a rejoining replica.
    Recovery = 1,
}

impl TableStreamType {
    /// The wire ordinal for this stream type.
    #[inline]
    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_are_stable() {
        assert_eq!(Command::Initialize.code(), 0);
        assert_eq!(Command::LoadCatalog.code(), 2);
        assert_eq!(Command::Tick.code(), 4);
        assert_eq!(Command::GetStats.code(), 5);
        assert_eq!(Command::QueryPlanFragments.code(), 6);
        assert_eq!(Command::PlanFragment.code(), 7);
        assert_eq!(Command::LoadTable.code(), 9);
        assert_eq!(Command::ReleaseUndoToken.code(), 10);
        assert_eq!(Command::UndoUndoToken.code(), 11);
        assert_eq!(Command::CustomPlanFragment.code(), 12);
        assert_eq!(Command::SetLogLevels.code(), 13);
        assert_eq!(Command::Quiesce.code(), 16);
        assert_eq!(Command::ActivateTableStream.code(), 17);
        assert_eq!(Command::TableStreamSerializeMore.code(), 18);
        assert_eq!(Command::UpdateCatalog.code(), 19);
        assert_eq!(Command::ExportAction.code(), 20);
        assert_eq!(Command::RecoveryMessage.code(), 21);
        assert_eq!(Command::TableHashCode.code(), 22);
        assert_eq!(Command::Hashinate.code(), 23);
    }

    #[test]
    fn test_stream_type_ordinals() {
        assert_eq!(TableStreamType::Snapshot.ordinal(), 0);
        assert_eq!(TableStreamType::Recovery.ordinal(), 1);
    }

    #[test]
    fn test_stats_selector_ordinals() {
        assert_eq!(StatsSelector::Table.ordinal(), 0);
        assert_eq!(StatsSelector::Memory.ordinal(), 5);
    }
}
