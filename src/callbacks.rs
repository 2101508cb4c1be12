//! Host-provided callbacks (§6). Modeled as plain function pointers generic
//! over the opaque user-context type, mirroring the reference firmware's
//! function-pointer callback style rather than a boxed trait object — no
//! allocation, and the signature is fixed at compile time per instance.
//!
//! The callback receives the instance's user-context (`&mut U`) rather than
//! the instance itself: the engine invokes callbacks from inside
//! [`crate::engine::Engine::process`], which already holds `&mut self`, so a
//! second `&mut` to the instance would alias.

/// Invoked before any write function's effect. `false` rejects the write
/// with [`crate::error::Exception::SlaveDeviceFailure`].
///
/// Arguments: user context, function code, start address, quantity.
pub type WriteCallback<U> = fn(&mut U, u8, u16, u16) -> bool;

/// Invoked for function code 0x64. `false` rejects with
/// [`crate::error::Exception::IllegalDataValue`].
///
/// Arguments: user context, parameter address, parameter value. Must not
/// block on persistence or reset inline — flip a deferred-work flag in `U`
/// and let the host's idle loop drain it.
pub type CustomConfigCallback<U> = fn(&mut U, u16, u16) -> bool;
