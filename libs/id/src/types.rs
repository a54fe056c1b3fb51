//! Id types for control-plane records.

use crate::define_id;

// A unit of work submitted for execution on some machine.
define_id!(TaskId, "tsk");

// A named workload unit (agent profile) that tasks may be submitted under.
define_id!(AgentId, "agt");
