// ==== Triggering metrics ====
/// Gauge for the number of buckets currently running a poll loop
pub const POLLING_BUCKETS: &str = "task_triggering_polling_buckets";

/// Gauge for offsets staged for commit per bucket
pub const OFFSETS_TO_BE_COMMITTED: &str = "task_triggering_offsets_to_be_committed";

/// Gauge for offsets completed but not yet at the head of their partition
pub const OFFSETS_COMPLETED: &str = "task_triggering_offsets_completed";

/// Gauge for polled offsets still outstanding per bucket
pub const OFFSETS_OUTSTANDING: &str = "task_triggering_offsets";

/// Gauge for records fetched but not yet handed to processing
pub const UNPROCESSED_FETCHED_RECORDS: &str = "task_triggering_unprocessed_fetched_records";

/// Counter for trigger messages received from Kafka
pub const TRIGGERS_RECEIVED: &str = "task_triggering_triggers_received_total";

/// Counter for offset commit attempts
pub const COMMITS: &str = "task_triggering_commits_total";

/// Counter for commit attempts that failed with a transient broker condition
pub const FAILED_COMMITS: &str = "task_triggering_failed_commits_total";

/// Counter for completion signals whose offset was already committed away
pub const ALREADY_COMMITTED_OFFSETS: &str = "task_triggering_already_committed_offsets_total";

/// Counter for tasks marked as ERROR by the trigger path
pub const TASKS_MARKED_ERROR: &str = "task_triggering_tasks_marked_error_total";

/// Counter for task status changes that failed (stale version)
pub const FAILED_STATUS_CHANGES: &str = "task_triggering_failed_status_changes_total";
