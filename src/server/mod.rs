//! Server-side data model and handler orchestration
//!
//! The server owns the per-unit register banks behind one coarse lock,
//! plus the policy hooks the processors consult: an optional request
//! validator, an optional change listener, and the events-enabled flag.
//! Handlers borrow the banks only for the duration of a dispatch, with
//! the lock held; the lock is never held across a suspension point.

pub(crate) mod functions;
pub mod handler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bank::ModbusRegisterBank;
use crate::constants::{DEFAULT_TABLE_SIZE, EXCEPTION_FLAG, MODBUS_FRAME_CAPACITY};
use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::frame::FrameBuffer;
use crate::server::functions::ProcessorContext;
use crate::server::handler::{HandlerHandle, RequestHandler, RequestTransport};

/// How handlers are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcurrencyMode {
    /// The caller drives each handler inline; no background tasks
    Synchronous,
    /// Each handler runs a background receive task; the server-wide lock
    /// serializes access to the register banks
    Asynchronous,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unit identifiers this server answers for
    #[serde(default = "default_units")]
    pub units: Vec<u8>,
    /// Concurrency mode, fixed at construction
    #[serde(default = "default_mode")]
    pub mode: ConcurrencyMode,
    /// Initial state of the change-event flag
    #[serde(default = "default_raise_events")]
    pub enable_raising_events: bool,
    /// Addressable coils per unit
    #[serde(default = "default_table_size")]
    pub coil_count: u32,
    /// Addressable holding registers per unit
    #[serde(default = "default_table_size")]
    pub holding_register_count: u32,
    /// Addressable input registers (and discrete inputs) per unit
    #[serde(default = "default_table_size")]
    pub input_register_count: u32,
    /// Frame buffer capacity for handlers (>= 260 for Modbus/TCP)
    #[serde(default = "default_frame_capacity")]
    pub frame_capacity: usize,
}

fn default_units() -> Vec<u8> {
    vec![1]
}
fn default_mode() -> ConcurrencyMode {
    ConcurrencyMode::Asynchronous
}
fn default_raise_events() -> bool {
    true
}
fn default_table_size() -> u32 {
    DEFAULT_TABLE_SIZE
}
fn default_frame_capacity() -> usize {
    MODBUS_FRAME_CAPACITY
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            units: default_units(),
            mode: default_mode(),
            enable_raising_events: default_raise_events(),
            coil_count: default_table_size(),
            holding_register_count: default_table_size(),
            input_register_count: default_table_size(),
            frame_capacity: default_frame_capacity(),
        }
    }
}

impl ServerConfig {
    /// Parse a configuration from JSON
    pub fn from_json(json: &str) -> ModbusResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Policy callback consulted before every validated access
///
/// `(unit, function, address, quantity)`; returning a code aborts the
/// request with that exception. Runs while the server-wide lock is held and
/// must not call back into the server.
pub type RequestValidator = Box<dyn Fn(u8, u8, u16, u16) -> Option<ExceptionCode> + Send + Sync>;

/// Change notifications fired by the write processors
///
/// Called only when events are enabled and at least one stored value
/// changed; `addresses` is exactly the set of changed indices. Runs while
/// the server-wide lock is held and must not call back into the server.
pub trait ChangeListener: Send + Sync {
    fn coils_changed(&self, unit: u8, addresses: &[u16]);
    fn registers_changed(&self, unit: u8, addresses: &[u16]);
}

/// Server statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    /// Requests dispatched
    pub total_requests: u64,
    /// Responses with the original function code
    pub successful_responses: u64,
    /// Responses with the exception flag set
    pub exception_responses: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    total_requests: AtomicU64,
    successful_responses: AtomicU64,
    exception_responses: AtomicU64,
}

impl StatsCounters {
    fn record(&self, response: &[u8]) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match response.first() {
            Some(&fc) if fc & EXCEPTION_FLAG != 0 => {
                self.exception_responses.fetch_add(1, Ordering::Relaxed);
            }
            Some(_) => {
                self.successful_responses.fetch_add(1, Ordering::Relaxed);
            }
            None => {}
        }
    }

    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_responses: self.successful_responses.load(Ordering::Relaxed),
            exception_responses: self.exception_responses.load(Ordering::Relaxed),
        }
    }
}

/// Modbus server data model shared by all handlers
pub struct ModbusServer {
    config: ServerConfig,
    banks: Mutex<HashMap<u8, ModbusRegisterBank>>,
    validator: Option<RequestValidator>,
    listener: Option<Arc<dyn ChangeListener>>,
    raise_events: AtomicBool,
    stats: StatsCounters,
}

impl ModbusServer {
    /// Create a server with one register bank per configured unit
    pub fn new(config: ServerConfig) -> Self {
        let banks = config
            .units
            .iter()
            .map(|&unit| {
                (
                    unit,
                    ModbusRegisterBank::with_sizes(
                        config.coil_count,
                        config.holding_register_count,
                        config.input_register_count,
                    ),
                )
            })
            .collect();
        debug!(units = ?config.units, mode = ?config.mode, "created Modbus server");
        Self {
            raise_events: AtomicBool::new(config.enable_raising_events),
            config,
            banks: Mutex::new(banks),
            validator: None,
            listener: None,
            stats: StatsCounters::default(),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Whether handlers run background receive tasks
    pub fn is_asynchronous(&self) -> bool {
        self.config.mode == ConcurrencyMode::Asynchronous
    }

    /// Install the request validator; call before sharing the server
    pub fn set_request_validator(&mut self, validator: RequestValidator) {
        self.validator = Some(validator);
    }

    /// Install the change listener; call before sharing the server
    pub fn set_change_listener(&mut self, listener: Arc<dyn ChangeListener>) {
        self.listener = Some(listener);
    }

    /// Whether change events are currently raised
    pub fn enable_raising_events(&self) -> bool {
        self.raise_events.load(Ordering::Relaxed)
    }

    /// Toggle change events; read by processors at invocation time
    pub fn set_enable_raising_events(&self, enabled: bool) {
        self.raise_events.store(enabled, Ordering::Relaxed);
    }

    /// Statistics snapshot
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Dispatch one request PDU for `unit`, producing the response PDU in
    /// the same buffer and returning its length
    ///
    /// The server-wide lock is held for the full processor execution and
    /// response write. The caller has already decided a response is
    /// required (broadcasts never reach this point).
    pub fn process_request(&self, unit: u8, frame: &mut FrameBuffer) -> ModbusResult<usize> {
        let len = {
            let mut banks = self.banks.lock();
            let mut ctx = ProcessorContext {
                unit,
                banks: &mut banks,
                validator: self.validator.as_deref(),
                listener: self.listener.as_deref(),
                raise_events: self.raise_events.load(Ordering::Relaxed),
                coil_count: self.config.coil_count,
                holding_register_count: self.config.holding_register_count,
                input_register_count: self.config.input_register_count,
            };
            handler::dispatch(frame, &mut ctx)?
        };
        self.stats.record(frame.response());
        Ok(len)
    }

    /// Spawn a background receive task for one connection
    ///
    /// Only valid in asynchronous mode; synchronous-mode callers drive
    /// [`RequestHandler::serve_request`] inline instead.
    pub fn spawn_handler<T: RequestTransport + 'static>(
        self: Arc<Self>,
        transport: T,
    ) -> ModbusResult<HandlerHandle> {
        if !self.is_asynchronous() {
            return Err(ModbusError::state(
                "spawn_handler requires asynchronous mode",
            ));
        }
        let handler = RequestHandler::new(self, transport);
        tracing::info!("spawning Modbus request handler task");
        Ok(HandlerHandle::spawn(handler))
    }

    fn with_bank<R>(
        &self,
        unit: u8,
        f: impl FnOnce(&mut ModbusRegisterBank) -> ModbusResult<R>,
    ) -> ModbusResult<R> {
        let mut banks = self.banks.lock();
        let bank = banks.get_mut(&unit).ok_or(ModbusError::UnknownUnit(unit))?;
        f(bank)
    }

    // ========================================================================
    // Simulation-side access (the process feeding the server)
    // ========================================================================

    /// Update a holding register value
    pub fn update_register(&self, unit: u8, address: u16, value: u16) -> ModbusResult<()> {
        self.with_bank(unit, |bank| bank.set_holding(address, value).map(|_| ()))
    }

    /// Update a coil value
    pub fn update_coil(&self, unit: u8, address: u16, value: bool) -> ModbusResult<()> {
        self.with_bank(unit, |bank| bank.set_coil(address, value).map(|_| ()))
    }

    /// Update an input register value
    pub fn update_input_register(&self, unit: u8, address: u16, value: u16) -> ModbusResult<()> {
        self.with_bank(unit, |bank| {
            bank.set_input_register(address, value).map(|_| ())
        })
    }

    /// Update a discrete input value
    pub fn update_discrete_input(&self, unit: u8, address: u16, value: bool) -> ModbusResult<()> {
        self.with_bank(unit, |bank| {
            bank.set_discrete_input(address, value).map(|_| ())
        })
    }

    /// Read a holding register value
    pub fn holding_register(&self, unit: u8, address: u16) -> ModbusResult<u16> {
        self.with_bank(unit, |bank| bank.holding(address))
    }

    /// Read a coil value
    pub fn coil(&self, unit: u8, address: u16) -> ModbusResult<bool> {
        self.with_bank(unit, |bank| bank.coil(address))
    }

    /// Read an input register value
    pub fn input_register(&self, unit: u8, address: u16) -> ModbusResult<u16> {
        self.with_bank(unit, |bank| bank.input_register(address))
    }

    /// Read a discrete input value
    pub fn discrete_input(&self, unit: u8, address: u16) -> ModbusResult<bool> {
        self.with_bank(unit, |bank| bank.discrete_input(address))
    }
}

impl std::fmt::Debug for ModbusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusServer")
            .field("units", &self.config.units)
            .field("mode", &self.config.mode)
            .field("enable_raising_events", &self.enable_raising_events())
            .field("has_validator", &self.validator.is_some())
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
