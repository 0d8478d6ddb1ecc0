//! The driver object: one per engine, one command in flight at a time.
//!
//! Every operation has the same shape: reset the frame buffer, append the
//! command code and its fields in wire order, flush through the transport,
//! then resolve the reply (which may interleave dependency callbacks). The
//! driver is strictly synchronous; the only suspension points are socket
//! reads and writes.

use std::path::Path;

use bytes::Bytes;

use crate::control::{BackendTarget, EngineProcess};
use crate::coordinator::Coordinator;
use crate::error::{EngineError, Result};
use crate::protocol::reply::{self, DependencySet};
use crate::protocol::{Command, FrameBuffer, StatsSelector, TableStreamType};
use crate::transport::Transport;

/// Identity and launch selection for one driver instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Index of the cluster this site belongs to.
    pub cluster_index: u32,
    /// Site id of the owning partition executor.
    pub site_id: u32,
    /// Partition this engine serves.
    pub partition_id: u32,
    /// Host id of the coordinator process.
    pub host_id: u32,
    /// Hostname reported to the engine.
    pub hostname: String,
    /// Initial log levels pushed to the engine at initialization.
    pub log_levels: u64,
    /// How the engine process comes to exist.
    pub target: BackendTarget,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cluster_index: 0,
            site_id: 0,
            partition_id: 0,
            host_id: 0,
            hostname: "localhost".to_string(),
            log_levels: 0,
            target: BackendTarget::Managed,
        }
    }
}

/// Result of an export action. The engine replies without a status byte
/// here: an offset (negative for failure) and, for polls, a data block.
#[derive(Debug, Clone)]
pub struct ExportResult {
    /// Stream offset acknowledged or polled; negative means the action
    /// failed engine-side.
    pub offset: i64,
    /// Polled export data, when the action polled and succeeded.
    pub data: Option<Bytes>,
}

impl ExportResult {
    /// Whether the engine rejected the action.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.offset < 0
    }
}

/// Host-side driver for one out-of-process execution engine.
pub struct EngineClient {
    cluster_index: u32,
    site_id: u32,
    partition_id: u32,
    host_id: u32,
    hostname: String,
    log_levels: u64,
    process: EngineProcess,
    transport: Transport,
    frame: FrameBuffer,
    coordinator: Box<dyn Coordinator>,
    dirty: bool,
}

impl EngineClient {
    /// Bring up the engine per the config, connect, and initialize it.
    ///
    /// The engine expects Initialize as its first command, so the driver
    /// issues it before returning.
    pub fn connect(config: EngineConfig, coordinator: Box<dyn Coordinator>) -> Result<Self> {
        let process = EngineProcess::launch(&config.target, config.site_id)?;
        let transport = Transport::connect(process.port())?;
        tracing::info!(site_id = config.site_id, "created IPC connection for site");

        let mut client = Self {
            cluster_index: config.cluster_index,
            site_id: config.site_id,
            partition_id: config.partition_id,
            host_id: config.host_id,
            hostname: config.hostname,
            log_levels: config.log_levels,
            process,
            transport,
            frame: FrameBuffer::new(),
            coordinator,
            dirty: false,
        };
        client.initialize()?;
        Ok(client)
    }

    /// Site id this driver serves.
    pub fn site_id(&self) -> u32 {
        self.site_id
    }

    /// Partition this driver serves.
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Read and clear the dirty flag latched by fragment execution. The
    /// coordinator uses it to detect whether a transaction touched any
    /// table.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Close the socket (the engine's shutdown signal), await the child and
    /// join its output reader.
    pub fn release(mut self) -> Result<()> {
        self.transport.close();
        self.process.shutdown()
    }

    fn round_trip(&mut self) -> Result<()> {
        self.transport.write_frame(&mut self.frame)?;
        reply::read_status(&mut self.transport, self.coordinator.as_mut())
    }

    /// Hand the engine its identity: cluster, site, partition, host and
    /// initial log levels. Issued automatically by [`connect`](Self::connect);
    /// the engine expects it before any other command.
    pub fn initialize(&mut self) -> Result<()> {
        self.frame.begin(Command::Initialize);
        self.frame.put_u32(self.cluster_index);
        self.frame.put_u32(self.site_id);
        self.frame.put_u32(self.partition_id);
        self.frame.put_u32(self.host_id);
        self.frame.put_u64(self.log_levels);
        self.frame.put_u16(self.hostname.len() as u16);
        self.frame.put_slice(self.hostname.as_bytes());
        self.round_trip()
    }

    /// Push the full serialized catalog, as a nul-terminated UTF-8 string.
    pub fn load_catalog(&mut self, catalog: &str) -> Result<()> {
        self.frame.begin(Command::LoadCatalog);
        self.frame.put_slice(catalog.as_bytes());
        self.frame.put_u8(0);
        self.round_trip()
    }

    /// Push a catalog diff, advancing the engine to `catalog_version`.
    pub fn update_catalog(&mut self, diff: &str, catalog_version: u32) -> Result<()> {
        self.frame.begin(Command::UpdateCatalog);
        self.frame.put_u32(catalog_version);
        self.frame.put_slice(diff.as_bytes());
        self.frame.put_u8(0);
        self.round_trip()
    }

    /// Periodic tick so the engine can age out resources.
    pub fn tick(&mut self, time: u64, last_committed_txn_id: u64) -> Result<()> {
        self.frame.begin(Command::Tick);
        self.frame.put_u64(time);
        self.frame.put_u64(last_committed_txn_id);
        self.round_trip()
    }

    /// Flush engine-side work up to the last committed transaction.
    pub fn quiesce(&mut self, last_committed_txn_id: u64) -> Result<()> {
        self.frame.begin(Command::Quiesce);
        self.frame.put_u64(last_committed_txn_id);
        self.round_trip()
    }

    /// Execute a single compiled plan fragment and collect the dependencies
    /// it produced. The engine may pull input dependencies mid-reply.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_plan_fragment(
        &mut self,
        plan_fragment_id: u64,
        output_dep_id: u32,
        input_dep_id: u32,
        parameter_set: &[u8],
        txn_id: u64,
        last_committed_txn_id: u64,
        undo_token: u64,
    ) -> Result<DependencySet> {
        self.frame.begin(Command::PlanFragment);
        self.frame.put_u64(txn_id);
        self.frame.put_u64(last_committed_txn_id);
        self.frame.put_u64(undo_token);
        self.frame.put_u64(plan_fragment_id);
        self.frame.put_u32(output_dep_id);
        self.frame.put_u32(input_dep_id);
        self.frame.put_slice(parameter_set);
        self.round_trip()?;

        let set = reply::read_dependency_set(&mut self.transport)?;
        if set.dirty {
            self.dirty = true;
        }
        Ok(set)
    }

    /// Execute an ad-hoc plan serialized as a string; yields one table.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_custom_plan_fragment(
        &mut self,
        plan: &str,
        output_dep_id: u32,
        input_dep_id: u32,
        txn_id: u64,
        last_committed_txn_id: u64,
        undo_token: u64,
    ) -> Result<Bytes> {
        self.frame.begin(Command::CustomPlanFragment);
        self.frame.put_u64(txn_id);
        self.frame.put_u64(last_committed_txn_id);
        self.frame.put_u64(undo_token);
        self.frame.put_u32(output_dep_id);
        self.frame.put_u32(input_dep_id);
        self.frame.put_u32(plan.len() as u32);
        self.frame.put_slice(plan.as_bytes());
        self.round_trip()?;

        let (dirty, mut tables) = reply::read_result_tables(&mut self.transport, 1)?;
        if dirty {
            self.dirty = true;
        }
        Ok(tables.pop().expect("decoder produced exactly one table"))
    }

    /// Execute a batch of query plan fragments; yields one result table per
    /// fragment, in order.
    ///
    /// `input_dep_ids` and `output_dep_ids` pair up with `fragment_ids`;
    /// `parameter_sets` are pre-serialized and sent back to back.
    #[allow(clippy::too_many_arguments)]
    pub fn execute_query_plan_fragments(
        &mut self,
        fragment_ids: &[u64],
        input_dep_ids: &[u32],
        output_dep_ids: &[u32],
        parameter_sets: &[&[u8]],
        txn_id: u64,
        last_committed_txn_id: u64,
        undo_token: u64,
    ) -> Result<Vec<Bytes>> {
        assert_eq!(fragment_ids.len(), input_dep_ids.len());
        assert_eq!(fragment_ids.len(), output_dep_ids.len());

        self.frame.begin(Command::QueryPlanFragments);
        self.frame.put_u64(txn_id);
        self.frame.put_u64(last_committed_txn_id);
        self.frame.put_u64(undo_token);
        self.frame.put_u32(fragment_ids.len() as u32);
        self.frame.put_u32(parameter_sets.len() as u32);
        for &fragment_id in fragment_ids {
            self.frame.put_u64(fragment_id);
        }
        for &input_dep_id in input_dep_ids {
            self.frame.put_u32(input_dep_id);
        }
        for &output_dep_id in output_dep_ids {
            self.frame.put_u32(output_dep_id);
        }
        for parameter_set in parameter_sets {
            self.frame.put_slice(parameter_set);
        }
        self.round_trip()?;

        let (dirty, tables) = reply::read_result_tables(&mut self.transport, fragment_ids.len())?;
        if dirty {
            self.dirty = true;
        }
        Ok(tables)
    }

    /// Bulk-load a serialized table into the engine.
    pub fn load_table(
        &mut self,
        table_id: u32,
        table: &[u8],
        txn_id: u64,
        last_committed_txn_id: u64,
        undo_token: u64,
        allow_export: bool,
    ) -> Result<()> {
        self.frame.begin(Command::LoadTable);
        self.frame.put_u32(table_id);
        self.frame.put_u64(txn_id);
        self.frame.put_u64(last_committed_txn_id);
        self.frame.put_u64(undo_token);
        self.frame.put_u16(allow_export as u16);
        self.frame.put_slice(table);
        self.round_trip()
    }

    /// Fetch one statistics table for the selector, scoped to `locators`.
    pub fn get_stats(
        &mut self,
        selector: StatsSelector,
        locators: &[u32],
        interval: bool,
        now: u64,
    ) -> Result<Bytes> {
        self.frame.begin(Command::GetStats);
        self.frame.put_u32(selector.ordinal());
        self.frame.put_u8(interval as u8);
        self.frame.put_u64(now);
        self.frame.put_u32(locators.len() as u32);
        for &locator in locators {
            self.frame.put_u32(locator);
        }
        self.round_trip()?;
        reply::read_stats_table(&mut self.transport)
    }

    /// Release undo state up to `undo_token` (commit path).
    pub fn release_undo_token(&mut self, undo_token: u64) -> Result<()> {
        self.frame.begin(Command::ReleaseUndoToken);
        self.frame.put_u64(undo_token);
        self.round_trip()
    }

    /// Roll back effects newer than `undo_token`.
    pub fn undo_undo_token(&mut self, undo_token: u64) -> Result<()> {
        self.frame.begin(Command::UndoUndoToken);
        self.frame.put_u64(undo_token);
        self.round_trip()
    }

    /// Update the engine's log levels.
    pub fn set_log_levels(&mut self, log_levels: u64) -> Result<()> {
        self.frame.begin(Command::SetLogLevels);
        self.frame.put_u64(log_levels);
        self.round_trip()
    }

    /// Begin streaming a table's contents.
    pub fn activate_table_stream(
        &mut self,
        table_id: u32,
        stream_type: TableStreamType,
    ) -> Result<()> {
        self.frame.begin(Command::ActivateTableStream);
        self.frame.put_u32(table_id);
        self.frame.put_u32(stream_type.ordinal());
        self.round_trip()
    }

    /// Pull the next chunk of an activated table stream into `buffer`.
    ///
    /// Returns exactly the number of bytes copied: 0 at end-of-stream, −1
    /// when the engine reports an error for this stream.
    pub fn table_stream_serialize_more(
        &mut self,
        buffer: &mut [u8],
        table_id: u32,
        stream_type: TableStreamType,
    ) -> Result<i32> {
        self.frame.begin(Command::TableStreamSerializeMore);
        self.frame.put_u32(table_id);
        self.frame.put_u32(stream_type.ordinal());
        self.frame.put_u32(buffer.len() as u32);
        self.round_trip()?;

        let length = self.transport.read_i32()?;
        if length <= 0 {
            return Ok(length);
        }
        let length_usize = length as usize;
        if length_usize > buffer.len() {
            return Err(EngineError::Protocol(format!(
                "stream chunk of {length_usize} bytes exceeds capacity {}",
                buffer.len()
            )));
        }
        self.transport.read_into(&mut buffer[..length_usize])?;
        Ok(length)
    }

    /// Drive the export stream for a table: ack, poll, reset or sync.
    ///
    /// This command has no status byte; the engine answers with an offset
    /// immediately. The asymmetry is the engine's contract.
    #[allow(clippy::too_many_arguments)]
    pub fn export_action(
        &mut self,
        ack: bool,
        poll: bool,
        reset: bool,
        sync: bool,
        ack_offset: u64,
        seq_no: u64,
        table_id: u64,
    ) -> Result<ExportResult> {
        self.frame.begin(Command::ExportAction);
        self.frame.put_u32(ack as u32);
        self.frame.put_u32(poll as u32);
        self.frame.put_u32(reset as u32);
        self.frame.put_u32(sync as u32);
        self.frame.put_u64(ack_offset);
        self.frame.put_u64(seq_no);
        self.frame.put_u64(table_id);
        self.transport.write_frame(&mut self.frame)?;

        let offset = self.transport.read_i64()?;
        if offset < 0 || !poll {
            return Ok(ExportResult { offset, data: None });
        }
        let size = self.transport.read_u32()?;
        let data = self.transport.read_exact_bytes(size as usize)?;
        Ok(ExportResult {
            offset,
            data: Some(data),
        })
    }

    /// Forward a recovery message to the engine.
    pub fn process_recovery_message(&mut self, message: &[u8]) -> Result<()> {
        self.frame.begin(Command::RecoveryMessage);
        self.frame.put_u32(message.len() as u32);
        self.frame.put_slice(message);
        self.round_trip()
    }

    /// Content hash of a table, for replica divergence checks.
    pub fn table_hash_code(&mut self, table_id: u32) -> Result<u64> {
        self.frame.begin(Command::TableHashCode);
        self.frame.put_u32(table_id);
        self.round_trip()?;
        self.transport.read_u64()
    }

    /// Ask the engine which partition a value hashes to.
    ///
    /// `parameter_set` is a serialized single-value parameter set.
    pub fn hashinate(&mut self, parameter_set: &[u8], partition_count: u32) -> Result<u32> {
        self.frame.begin(Command::Hashinate);
        self.frame.put_u32(partition_count);
        self.frame.put_slice(parameter_set);
        self.round_trip()?;
        self.transport.read_u32()
    }

    // Operations the engine does not expose over IPC. All fail before
    // touching the socket.

    /// Profiler toggling is unsupported over IPC.
    pub fn toggle_profiler(&mut self, _toggle: u32) -> Result<u32> {
        Err(EngineError::NotImplemented(
            "Profiler is disabled for IPC ExecutionEngine",
        ))
    }

    /// Read/write-set tracking is unsupported over IPC.
    pub fn tracking_enable(&mut self, _txn_id: u64) -> Result<()> {
        Err(EngineError::NotImplemented(
            "Read/Write Set Tracking is disabled for IPC ExecutionEngine",
        ))
    }

    /// Read/write-set tracking is unsupported over IPC.
    pub fn tracking_finish(&mut self, _txn_id: u64) -> Result<()> {
        Err(EngineError::NotImplemented(
            "Read/Write Set Tracking is disabled for IPC ExecutionEngine",
        ))
    }

    /// Read/write-set tracking is unsupported over IPC.
    pub fn tracking_read_set(&mut self, _txn_id: u64) -> Result<Bytes> {
        Err(EngineError::NotImplemented(
            "Read/Write Set Tracking is disabled for IPC ExecutionEngine",
        ))
    }

    /// Read/write-set tracking is unsupported over IPC.
    pub fn tracking_write_set(&mut self, _txn_id: u64) -> Result<Bytes> {
        Err(EngineError::NotImplemented(
            "Read/Write Set Tracking is disabled for IPC ExecutionEngine",
        ))
    }

    /// Anti-caching is unsupported over IPC.
    pub fn anti_cache_initialize(&mut self, _db_path: &Path, _block_size: u64) -> Result<()> {
        Err(EngineError::NotImplemented(
            "Anti-Caching is disabled for IPC ExecutionEngine",
        ))
    }

    /// Anti-caching is unsupported over IPC.
    pub fn anti_cache_read_blocks(
        &mut self,
        _table_id: u32,
        _block_ids: &[u16],
        _tuple_offsets: &[u32],
    ) -> Result<()> {
        Err(EngineError::NotImplemented(
            "Anti-Caching is disabled for IPC ExecutionEngine",
        ))
    }

    /// Anti-caching is unsupported over IPC.
    pub fn anti_cache_merge_blocks(&mut self, _table_id: u32) -> Result<()> {
        Err(EngineError::NotImplemented(
            "Anti-Caching is disabled for IPC ExecutionEngine",
        ))
    }

    /// Anti-caching is unsupported over IPC.
    pub fn anti_cache_evict_block(
        &mut self,
        _table_id: u32,
        _block_size: u64,
        _num_blocks: u32,
    ) -> Result<Bytes> {
        Err(EngineError::NotImplemented(
            "Anti-Caching is disabled for IPC ExecutionEngine",
        ))
    }

    /// Storage MMAP is unsupported over IPC.
    pub fn mmap_initialize(
        &mut self,
        _db_dir: &Path,
        _map_size: u64,
        _sync_frequency: u64,
    ) -> Result<()> {
        Err(EngineError::NotImplemented(
            "Storage MMAP is disabled for IPC ExecutionEngine",
        ))
    }

    /// ARIES recovery is unsupported over IPC.
    pub fn aries_initialize(&mut self, _db_dir: &Path, _log_file: &Path) -> Result<()> {
        Err(EngineError::NotImplemented(
            "ARIES recovery is disabled for IPC ExecutionEngine",
        ))
    }

    /// ARIES recovery is unsupported over IPC.
    pub fn aries_log_buffer_length(&mut self) -> Result<u64> {
        Err(EngineError::NotImplemented(
            "ARIES recovery is disabled for IPC ExecutionEngine",
        ))
    }

    /// Table extraction is unsupported over IPC.
    pub fn extract_table(&mut self, _table_id: u32, _destination: &Path) -> Result<u64> {
        Err(EngineError::NotImplemented(
            "ExtractTable is disabled for IPC ExecutionEngine",
        ))
    }

    /// File-based table loading is unsupported over IPC.
    pub fn load_table_from_file(&mut self, _table_id: u32, _source: &Path) -> Result<u64> {
        Err(EngineError::NotImplemented(
            "LoadTable is disabled for IPC ExecutionEngine",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.cluster_index, 0);
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.target, BackendTarget::Managed);
    }

    #[test]
    fn test_export_result_error_flag() {
        let failed = ExportResult {
            offset: -1,
            data: None,
        };
        assert!(failed.is_error());

        let ok = ExportResult {
            offset: 4096,
            data: None,
        };
        assert!(!ok.is_error());
    }
}
