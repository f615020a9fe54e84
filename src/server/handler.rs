//! Request handler: PDU dispatch and per-connection lifecycle
//!
//! The dispatcher is purely CPU-bound and runs under the server-wide data
//! lock; only the transport receive suspends. One handler exists per
//! connection, so requests on a connection are processed strictly in
//! arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{
    function_code_description, BROADCAST_UNIT_ID, FC_READ_COILS, FC_READ_DISCRETE_INPUTS,
    FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_READ_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER,
};
use crate::error::{ExceptionCode, ModbusError, ModbusResult};
use crate::frame::FrameBuffer;
use crate::server::functions::{self, ProcessorContext};
use crate::server::ModbusServer;

/// Transport seam supplied by a framing adapter (Modbus/TCP, RTU, ...)
///
/// The adapter owns framing and I/O; the handler owns the PDU. An
/// in-flight `receive_request` should abort with
/// [`ModbusError::Cancelled`] when the handler's cancellation token fires
/// (see [`HandlerHandle::cancellation_token`]).
#[async_trait]
pub trait RequestTransport: Send {
    /// Read one request, strip the framing, place the PDU in `frame`
    /// (`load_request` / `set_request_len`) and return the unit identifier
    async fn receive_request(&mut self, frame: &mut FrameBuffer) -> ModbusResult<u8>;

    /// Wrap the response PDU in framing and transmit it
    async fn send_response(&mut self, frame: &FrameBuffer) -> ModbusResult<()>;

    /// Whether the request demands a response; broadcasts do not
    fn response_required(&self, unit: u8) -> bool {
        unit != BROADCAST_UNIT_ID
    }
}

/// Per-request processing states of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Waiting for the transport to begin a read
    Idle,
    /// Transport read in progress
    Receiving,
    /// A full PDU is in the buffer
    Ready,
    /// Dispatcher running
    Processing,
}

/// Select the processor for `fc` and run it, converting any processor
/// fault into a `ServerDeviceFailure` exception for the original code
///
/// Returns the response length. The writer starts at 0; on exit the buffer
/// holds exactly the response PDU. Never fails for protocol-level causes;
/// the only fatal path is being unable to place the 2-byte exception PDU.
pub(crate) fn dispatch(
    frame: &mut FrameBuffer,
    ctx: &mut ProcessorContext<'_>,
) -> ModbusResult<usize> {
    if !frame.is_ready() {
        return Err(ModbusError::NotReady);
    }
    frame.seek_read(0)?;
    let fc = frame.read_u8()?;
    frame.seek_write(0)?;
    debug!(
        unit = ctx.unit,
        function = fc,
        desc = function_code_description(fc),
        "dispatching request"
    );

    let result = match fc {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS => functions::read_bits(ctx, frame, fc),
        FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
            functions::read_registers(ctx, frame, fc)
        }
        FC_WRITE_SINGLE_COIL => functions::write_single_coil(ctx, frame),
        FC_WRITE_SINGLE_REGISTER => functions::write_single_register(ctx, frame),
        FC_WRITE_MULTIPLE_REGISTERS => functions::write_multiple_registers(ctx, frame),
        FC_READ_WRITE_MULTIPLE_REGISTERS => functions::read_write_multiple_registers(ctx, frame),
        // FC15 is reserved here, rejected like every unknown code
        FC_WRITE_MULTIPLE_COILS => functions::illegal_function(frame, fc),
        _ => functions::illegal_function(frame, fc),
    };

    if let Err(fault) = result {
        warn!(
            unit = ctx.unit,
            function = fc,
            error = %fault,
            "processor fault, responding with server device failure"
        );
        functions::write_exception(frame, fc, ExceptionCode::ServerDeviceFailure)?;
    }
    Ok(frame.response_len())
}

/// One Modbus request handler bound to one connection
///
/// In synchronous mode the caller drives [`serve_request`] inline; in
/// asynchronous mode [`ModbusServer::spawn_handler`] moves the handler
/// into a background receive task.
///
/// [`serve_request`]: Self::serve_request
pub struct RequestHandler<T: RequestTransport> {
    server: Arc<ModbusServer>,
    transport: T,
    frame: FrameBuffer,
    state: HandlerState,
}

impl<T: RequestTransport> RequestHandler<T> {
    /// Create a handler with the server's configured frame capacity
    pub fn new(server: Arc<ModbusServer>, transport: T) -> Self {
        let capacity = server.config().frame_capacity;
        Self::with_capacity(server, transport, capacity)
    }

    /// Create a handler with an explicit frame capacity
    pub fn with_capacity(server: Arc<ModbusServer>, transport: T, capacity: usize) -> Self {
        Self {
            server,
            transport,
            frame: FrameBuffer::with_capacity(capacity),
            state: HandlerState::Idle,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Receive one request, process it, transmit the response
    ///
    /// Broadcast requests are received and dropped without processing or
    /// response.
    pub async fn serve_request(&mut self) -> ModbusResult<()> {
        self.state = HandlerState::Receiving;
        self.frame.reset();
        let unit = match self.transport.receive_request(&mut self.frame).await {
            Ok(unit) => unit,
            Err(e) => {
                self.state = HandlerState::Idle;
                return Err(e);
            }
        };
        if !self.frame.is_ready() {
            self.state = HandlerState::Idle;
            return Err(ModbusError::NotReady);
        }
        self.state = HandlerState::Ready;

        if !self.transport.response_required(unit) {
            debug!(unit, "no response required, dropping request");
            self.state = HandlerState::Idle;
            return Ok(());
        }

        self.state = HandlerState::Processing;
        let len = self.server.process_request(unit, &mut self.frame)?;
        debug!(unit, len, "response ready");
        self.transport.send_response(&self.frame).await?;
        self.state = HandlerState::Idle;
        Ok(())
    }

    /// Receive loop for asynchronous mode: serve requests until cancelled
    pub async fn run(mut self, cancel: CancellationToken) -> ModbusResult<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("request handler cancelled");
                    return Ok(());
                }
                result = self.serve_request() => {
                    match result {
                        Ok(()) => {}
                        Err(ModbusError::Cancelled) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

/// Handle to a spawned receive task
#[derive(Debug)]
pub struct HandlerHandle {
    cancel: CancellationToken,
    task: JoinHandle<ModbusResult<()>>,
}

impl HandlerHandle {
    pub(crate) fn spawn<T: RequestTransport + 'static>(
        handler: RequestHandler<T>,
    ) -> HandlerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handler.run(cancel.clone()));
        HandlerHandle { cancel, task }
    }

    /// The handler's cancellation signal, for the transport to abort
    /// in-flight reads on
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal cancellation and await the receive task to completion
    ///
    /// Cancellation surfaced as a task fault is swallowed; any other fault
    /// is propagated.
    pub async fn shutdown(self) -> ModbusResult<()> {
        self.cancel.cancel();
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ModbusError::Cancelled)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(join) if join.is_cancelled() => Ok(()),
            Err(join) => Err(ModbusError::internal(format!(
                "handler task failed: {}",
                join
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use std::collections::VecDeque;

    /// Transport fed from a queue of canned PDUs, recording responses
    struct QueueTransport {
        requests: VecDeque<(u8, Vec<u8>)>,
        responses: Vec<Vec<u8>>,
    }

    impl QueueTransport {
        fn new(requests: Vec<(u8, Vec<u8>)>) -> Self {
            Self {
                requests: requests.into(),
                responses: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl RequestTransport for QueueTransport {
        async fn receive_request(&mut self, frame: &mut FrameBuffer) -> ModbusResult<u8> {
            match self.requests.pop_front() {
                Some((unit, pdu)) => {
                    frame.load_request(&pdu)?;
                    Ok(unit)
                }
                None => Err(ModbusError::Cancelled),
            }
        }

        async fn send_response(&mut self, frame: &FrameBuffer) -> ModbusResult<()> {
            self.responses.push(frame.response().to_vec());
            Ok(())
        }
    }

    fn test_server() -> Arc<ModbusServer> {
        Arc::new(ModbusServer::new(ServerConfig::default()))
    }

    #[tokio::test]
    async fn test_serve_request_round_trip() {
        let server = test_server();
        server.update_register(1, 0, 0x1234).unwrap();
        server.update_register(1, 1, 0x5678).unwrap();

        let transport = QueueTransport::new(vec![(1, vec![0x03, 0x00, 0x00, 0x00, 0x02])]);
        let mut handler = RequestHandler::new(server, transport);

        assert_eq!(handler.state(), HandlerState::Idle);
        handler.serve_request().await.unwrap();
        assert_eq!(handler.state(), HandlerState::Idle);
        assert_eq!(
            handler.transport.responses,
            vec![vec![0x03, 0x04, 0x12, 0x34, 0x56, 0x78]]
        );
    }

    #[tokio::test]
    async fn test_broadcast_produces_no_response() {
        let server = test_server();
        let transport = QueueTransport::new(vec![(0, vec![0x06, 0x00, 0x07, 0x00, 0xAA])]);
        let mut handler = RequestHandler::new(server.clone(), transport);

        handler.serve_request().await.unwrap();
        assert!(handler.transport.responses.is_empty());
        // Broadcast requests are dropped entirely, not applied
        assert_eq!(server.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn test_empty_request_is_not_ready() {
        let server = test_server();
        let transport = QueueTransport::new(vec![(1, vec![])]);
        let mut handler = RequestHandler::new(server, transport);

        let err = handler.serve_request().await.unwrap_err();
        assert!(matches!(err, ModbusError::NotReady));
    }

    #[tokio::test]
    async fn test_run_ends_on_transport_cancellation() {
        let server = test_server();
        let transport = QueueTransport::new(vec![(1, vec![0x03, 0x00, 0x00, 0x00, 0x01])]);
        let handler = RequestHandler::new(server, transport);

        // The queue drains and reports Cancelled, which ends the loop cleanly
        let cancel = CancellationToken::new();
        handler.run(cancel).await.unwrap();
    }
}
