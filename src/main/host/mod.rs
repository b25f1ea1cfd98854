pub mod launch;
pub mod ptrace;
pub mod syscall;
pub mod tracer;
