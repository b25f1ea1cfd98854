//! A ptrace-based supervisor that runs programs as sandboxed variants.
//!
//! Each thread group of variants is traced by a monitor running on its own OS thread. Monitors
//! are tracked by the [`MonitorRegistry`](core::registry::MonitorRegistry), which also carries
//! variants between monitors when a variant forks, and coordinates shutdown.

pub mod core;
pub mod host;
pub mod utility;
