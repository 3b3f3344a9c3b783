// Infrastructure shared by every stage of the backend. `error` defines JitError and the
// JitResult alias, `register_file` holds the physical register model (AsmReg, RegMask) and
// the per-block RegisterState the allocator works on, and `session` provides the bumpalo
// arena and statistics for one compilation. `adaptor` is the interface through which the
// runtime obtains method IR, and `compiler` runs a method body through the pipeline under
// a JitConfig.

//! Core rtjit infrastructure.

pub mod adaptor;
pub mod compiler;
pub mod error;
pub mod register_file;
pub mod session;

pub use adaptor::{MethodProvider, ModuleProvider};
pub use compiler::{compile_body, CompiledMethod, JitConfig, Target};
pub use error::{JitError, JitResult};
pub use register_file::{AsmReg, RegMask};
pub use session::{CompilationSession, SessionStats};
