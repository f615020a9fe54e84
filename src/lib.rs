//! # Voltage Modbus Server - Server-Side Request Handling Core
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Transport-agnostic server side of the Modbus application protocol in
//! pure Rust: decode an incoming request PDU, apply it to a shared
//! register model, produce the success or exception response PDU. Framing
//! (Modbus/TCP MBAP, RTU CRC, ASCII LRC), sockets and serial drivers live
//! in adapter crates behind the [`RequestTransport`] seam.
//!
//! ## Features
//!
//! - **Transport Agnostic**: the handler consumes a PDU plus a unit id and
//!   emits a PDU; any framing wraps it
//! - **Shared Data Model**: per-unit coil/discrete/holding/input tables
//!   behind one coarse lock
//! - **Change Events**: write processors report exactly the addresses
//!   whose stored value changed
//! - **Policy Hook**: an optional request validator can veto any access
//!   with a chosen exception code
//! - **Async or Inline**: background receive tasks with cancellation, or
//!   caller-driven dispatch
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Server |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ |
//! | 0x03 | Read Holding Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Single Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x0F | Write Multiple Coils | ❌ (Illegal Function) |
//! | 0x10 | Write Multiple Registers | ✅ |
//! | 0x17 | Read/Write Multiple Registers | ✅ |
//!
//! Any other code yields an Illegal Function exception.
//!
//! ## Quick Start
//!
//! ```rust
//! use voltage_modbus_server::{FrameBuffer, ModbusServer, ServerConfig};
//!
//! let server = ModbusServer::new(ServerConfig::default());
//! server.update_register(1, 0, 0x1234).unwrap();
//!
//! // A transport adapter would fill the buffer from the wire
//! let mut frame = FrameBuffer::new();
//! frame.load_request(&[0x03, 0x00, 0x00, 0x00, 0x01]).unwrap();
//!
//! let len = server.process_request(1, &mut frame).unwrap();
//! assert_eq!(frame.response()[..len], [0x03, 0x02, 0x12, 0x34]);
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on official specification
pub mod constants;

/// Reusable frame buffer with independent read/write cursors
pub mod frame;

/// Per-unit register tables
pub mod bank;

/// Server data model, dispatch and handler lifecycle
pub mod server;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use bank::ModbusRegisterBank;
pub use constants::*;
pub use error::{ExceptionCode, ModbusError, ModbusResult};
pub use frame::FrameBuffer;
pub use server::handler::{HandlerHandle, HandlerState, RequestHandler, RequestTransport};
pub use server::{
    ChangeListener, ConcurrencyMode, ModbusServer, RequestValidator, ServerConfig, ServerStats,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
