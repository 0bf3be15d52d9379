//! Architecture-specific code. Only `x86_64` is implemented — this is the sole target this
//! hypervisor's VMX engine supports.

pub mod x86_64;
