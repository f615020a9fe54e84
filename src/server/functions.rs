//! Function-code processors
//!
//! One plain function per supported function code, each following the same
//! read/validate/mutate/write-response pattern over a [`FrameBuffer`]. The
//! dispatcher owns fault handling; a processor returns `Err` only for
//! internal faults, never for protocol violations (those become exception
//! PDUs and `Ok`).

use std::collections::HashMap;

use tracing::debug;

use crate::bank::ModbusRegisterBank;
use crate::constants::{
    COIL_OFF, COIL_ON, EXCEPTION_FLAG, FC_READ_COILS, FC_READ_HOLDING_REGISTERS,
    FC_READ_WRITE_MULTIPLE_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS,
};
use crate::error::{ExceptionCode, ModbusResult};
use crate::frame::FrameBuffer;
use crate::server::ChangeListener;

/// Largest bit-read payload: ceil(2000 / 8) bytes
const BIT_SCRATCH: usize = (MAX_READ_COILS as usize + 7) / 8;

/// Everything a processor may touch while the server-wide lock is held
pub(crate) struct ProcessorContext<'a> {
    pub unit: u8,
    pub banks: &'a mut HashMap<u8, ModbusRegisterBank>,
    pub validator:
        Option<&'a (dyn Fn(u8, u8, u16, u16) -> Option<ExceptionCode> + Send + Sync)>,
    pub listener: Option<&'a dyn ChangeListener>,
    pub raise_events: bool,
    pub coil_count: u32,
    pub holding_register_count: u32,
    pub input_register_count: u32,
}

impl<'a> ProcessorContext<'a> {
    fn bank(&mut self) -> ModbusResult<&mut ModbusRegisterBank> {
        let unit = self.unit;
        self.banks
            .get_mut(&unit)
            .ok_or(crate::error::ModbusError::UnknownUnit(unit))
    }

    /// Validation envelope shared by every processor
    ///
    /// Order matters: the installed validator sees the request first, then
    /// the address window is checked, then the quantity envelope. The sum
    /// is computed in 32 bits so a window at the top of the address space
    /// cannot wrap. Never mutates the store; at most one exception per
    /// violating request.
    pub(crate) fn check_register_bounds(
        &self,
        fc: u8,
        address: u16,
        max_address: u32,
        quantity: u16,
        max_quantity: u16,
    ) -> Option<ExceptionCode> {
        if let Some(validator) = self.validator {
            if let Some(code) = validator(self.unit, fc, address, quantity) {
                return Some(code);
            }
        }
        if u32::from(address) + u32::from(quantity) > max_address {
            return Some(ExceptionCode::IllegalDataAddress);
        }
        if quantity == 0 || quantity > max_quantity {
            return Some(ExceptionCode::IllegalDataValue);
        }
        None
    }

    fn emit_coils_changed(&self, addresses: &[u16]) {
        if self.raise_events && !addresses.is_empty() {
            if let Some(listener) = self.listener {
                listener.coils_changed(self.unit, addresses);
            }
        }
    }

    fn emit_registers_changed(&self, addresses: &[u16]) {
        if self.raise_events && !addresses.is_empty() {
            if let Some(listener) = self.listener {
                listener.registers_changed(self.unit, addresses);
            }
        }
    }
}

/// Overwrite the response with the 2-byte exception PDU for `fc`
pub(crate) fn write_exception(
    frame: &mut FrameBuffer,
    fc: u8,
    code: ExceptionCode,
) -> ModbusResult<()> {
    debug!(function = fc, exception = %code, "responding with exception");
    frame.seek_write(0)?;
    frame.push(fc | EXCEPTION_FLAG)?;
    frame.push(code.code())
}

/// Unsupported function code (including reserved FC15)
pub(crate) fn illegal_function(frame: &mut FrameBuffer, fc: u8) -> ModbusResult<()> {
    write_exception(frame, fc, ExceptionCode::IllegalFunction)
}

/// FC01 / FC02 — Read Coils, Read Discrete Inputs
pub(crate) fn read_bits(
    ctx: &mut ProcessorContext<'_>,
    frame: &mut FrameBuffer,
    fc: u8,
) -> ModbusResult<()> {
    let address = frame.read_u16()?;
    let quantity = frame.read_u16()?;

    let max_address = if fc == FC_READ_COILS {
        ctx.coil_count
    } else {
        ctx.input_register_count
    };
    if let Some(code) = ctx.check_register_bounds(fc, address, max_address, quantity, MAX_READ_COILS)
    {
        return write_exception(frame, fc, code);
    }

    let byte_count = quantity.div_ceil(8) as u8;
    let mut scratch = [0u8; BIT_SCRATCH];
    let bank = ctx.bank()?;
    if fc == FC_READ_COILS {
        bank.pack_coils(address, quantity, &mut scratch)?;
    } else {
        bank.pack_discrete_inputs(address, quantity, &mut scratch)?;
    }

    frame.push(fc)?;
    frame.push(byte_count)?;
    frame.extend(&scratch[..byte_count as usize])
}

/// FC03 / FC04 — Read Holding Registers, Read Input Registers
pub(crate) fn read_registers(
    ctx: &mut ProcessorContext<'_>,
    frame: &mut FrameBuffer,
    fc: u8,
) -> ModbusResult<()> {
    let address = frame.read_u16()?;
    let quantity = frame.read_u16()?;

    let holding = fc == FC_READ_HOLDING_REGISTERS;
    let max_address = if holding {
        ctx.holding_register_count
    } else {
        ctx.input_register_count
    };
    if let Some(code) =
        ctx.check_register_bounds(fc, address, max_address, quantity, MAX_READ_REGISTERS)
    {
        return write_exception(frame, fc, code);
    }

    let bank = ctx.bank()?;
    let words = if holding {
        bank.holding_window(address, quantity)?
    } else {
        bank.input_window(address, quantity)?
    };

    // Words are host-order in the bank; the wire wants big-endian
    frame.push(fc)?;
    frame.push((quantity * 2) as u8)?;
    for &word in words {
        frame.push_u16(word)?;
    }
    Ok(())
}

/// FC05 — Write Single Coil
pub(crate) fn write_single_coil(
    ctx: &mut ProcessorContext<'_>,
    frame: &mut FrameBuffer,
) -> ModbusResult<()> {
    let fc = FC_WRITE_SINGLE_COIL;
    let address = frame.read_u16()?;
    let value = frame.read_u16()?;

    if let Some(code) = ctx.check_register_bounds(fc, address, ctx.coil_count, 1, 1) {
        return write_exception(frame, fc, code);
    }
    let on = match value {
        COIL_ON => true,
        COIL_OFF => false,
        _ => return write_exception(frame, fc, ExceptionCode::IllegalDataValue),
    };

    let changed = ctx.bank()?.set_coil(address, on)?;
    if changed {
        ctx.emit_coils_changed(&[address]);
    }

    frame.push(fc)?;
    frame.push_u16(address)?;
    frame.push_u16(value)
}

/// FC06 — Write Single Register
pub(crate) fn write_single_register(
    ctx: &mut ProcessorContext<'_>,
    frame: &mut FrameBuffer,
) -> ModbusResult<()> {
    let fc = FC_WRITE_SINGLE_REGISTER;
    let address = frame.read_u16()?;
    let value = frame.read_u16()?;

    if let Some(code) = ctx.check_register_bounds(fc, address, ctx.holding_register_count, 1, 1) {
        return write_exception(frame, fc, code);
    }

    let changed = ctx.bank()?.set_holding(address, value)?;
    if changed {
        ctx.emit_registers_changed(&[address]);
    }

    frame.push(fc)?;
    frame.push_u16(address)?;
    frame.push_u16(value)
}

/// FC16 — Write Multiple Registers
pub(crate) fn write_multiple_registers(
    ctx: &mut ProcessorContext<'_>,
    frame: &mut FrameBuffer,
) -> ModbusResult<()> {
    let fc = FC_WRITE_MULTIPLE_REGISTERS;
    let address = frame.read_u16()?;
    let quantity = frame.read_u16()?;
    let byte_count = frame.read_u8()?;

    if let Some(code) = ctx.check_register_bounds(
        fc,
        address,
        ctx.holding_register_count,
        quantity,
        MAX_WRITE_REGISTERS,
    ) {
        return write_exception(frame, fc, code);
    }
    if u16::from(byte_count) != quantity * 2 {
        return write_exception(frame, fc, ExceptionCode::IllegalDataValue);
    }

    let changed = apply_register_write(ctx, frame, address, quantity, byte_count)?;
    ctx.emit_registers_changed(&changed);

    frame.push(fc)?;
    frame.push_u16(address)?;
    frame.push_u16(quantity)
}

/// FC23 — Read/Write Multiple Registers
///
/// Both windows are validated before any mutation, and the write is applied
/// before the read so overlapping windows read back the values just
/// written.
pub(crate) fn read_write_multiple_registers(
    ctx: &mut ProcessorContext<'_>,
    frame: &mut FrameBuffer,
) -> ModbusResult<()> {
    let fc = FC_READ_WRITE_MULTIPLE_REGISTERS;
    let read_address = frame.read_u16()?;
    let read_quantity = frame.read_u16()?;
    let write_address = frame.read_u16()?;
    let write_quantity = frame.read_u16()?;
    let byte_count = frame.read_u8()?;

    if let Some(code) = ctx.check_register_bounds(
        fc,
        read_address,
        ctx.holding_register_count,
        read_quantity,
        MAX_READ_REGISTERS,
    ) {
        return write_exception(frame, fc, code);
    }
    if let Some(code) = ctx.check_register_bounds(
        fc,
        write_address,
        ctx.holding_register_count,
        write_quantity,
        MAX_WRITE_REGISTERS,
    ) {
        return write_exception(frame, fc, code);
    }
    if u16::from(byte_count) != write_quantity * 2 {
        return write_exception(frame, fc, ExceptionCode::IllegalDataValue);
    }

    let changed = apply_register_write(ctx, frame, write_address, write_quantity, byte_count)?;
    ctx.emit_registers_changed(&changed);

    let bank = ctx.bank()?;
    let words = bank.holding_window(read_address, read_quantity)?;
    frame.push(fc)?;
    frame.push((read_quantity * 2) as u8)?;
    for &word in words {
        frame.push_u16(word)?;
    }
    Ok(())
}

/// Copy `byte_count` bytes of word values from the request into the holding
/// table, returning the addresses whose stored value changed
fn apply_register_write(
    ctx: &mut ProcessorContext<'_>,
    frame: &mut FrameBuffer,
    address: u16,
    quantity: u16,
    byte_count: u8,
) -> ModbusResult<Vec<u16>> {
    let data = frame.read_bytes(byte_count as usize)?;
    let window = ctx.bank()?.holding_window_mut(address, quantity)?;
    let mut changed = Vec::with_capacity(quantity as usize);
    for (i, slot) in window.iter_mut().enumerate() {
        let value = u16::from_be_bytes([data[2 * i], data[2 * i + 1]]);
        if *slot != value {
            *slot = value;
            changed.push(address + i as u16);
        }
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FC_READ_HOLDING_REGISTERS;

    fn test_banks() -> HashMap<u8, ModbusRegisterBank> {
        let mut banks = HashMap::new();
        banks.insert(1, ModbusRegisterBank::with_sizes(16, 16, 16));
        banks
    }

    fn ctx<'a>(banks: &'a mut HashMap<u8, ModbusRegisterBank>) -> ProcessorContext<'a> {
        ProcessorContext {
            unit: 1,
            banks,
            validator: None,
            listener: None,
            raise_events: false,
            coil_count: 16,
            holding_register_count: 16,
            input_register_count: 16,
        }
    }

    // ========== check_register_bounds ordering ==========

    #[test]
    fn test_bounds_address_checked_before_quantity() {
        let mut banks = test_banks();
        let ctx = ctx(&mut banks);

        // Both the window and the quantity are invalid; the address wins
        let code = ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0xFFFF, 16, 0, 125);
        assert_eq!(code, Some(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_bounds_quantity_envelope() {
        let mut banks = test_banks();
        let ctx = ctx(&mut banks);

        assert_eq!(
            ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0, 16, 0, 125),
            Some(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0, 0x1_0000, 126, 125),
            Some(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0, 16, 16, 125),
            None
        );
    }

    #[test]
    fn test_bounds_no_u16_wraparound() {
        let mut banks = test_banks();
        let ctx = ctx(&mut banks);

        // 0xFFFE + 5 must not wrap into a small address
        let code =
            ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0xFFFE, 0x1_0000, 5, 125);
        assert_eq!(code, Some(ExceptionCode::IllegalDataAddress));
    }

    #[test]
    fn test_validator_runs_first() {
        let mut banks = test_banks();
        let mut ctx = ctx(&mut banks);
        let validator =
            |_unit: u8, _fc: u8, _addr: u16, _qty: u16| Some(ExceptionCode::ServerDeviceBusy);
        ctx.validator = Some(&validator);

        // The validator's code wins even when the window is also invalid
        let code = ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0xFFFF, 16, 0, 125);
        assert_eq!(code, Some(ExceptionCode::ServerDeviceBusy));
    }

    #[test]
    fn test_validator_permits() {
        let mut banks = test_banks();
        let mut ctx = ctx(&mut banks);
        let validator =
            |_unit: u8, _fc: u8, _addr: u16, _qty: u16| -> Option<ExceptionCode> { None };
        ctx.validator = Some(&validator);

        assert_eq!(
            ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0, 16, 4, 125),
            None
        );
    }

    // ========== exception writer ==========

    #[test]
    fn test_write_exception_pdu_shape() {
        let mut frame = FrameBuffer::new();
        frame.load_request(&[0x03]).unwrap();
        frame.push(0x03).unwrap();
        frame.extend(&[0u8; 20]).unwrap();

        write_exception(&mut frame, 0x03, ExceptionCode::IllegalDataAddress).unwrap();
        assert_eq!(frame.response(), &[0x83, 0x02]);
    }

    #[test]
    fn test_bounds_never_mutates_store() {
        let mut banks = test_banks();
        let snapshot = banks.get(&1).unwrap().clone();
        let ctx = ctx(&mut banks);

        ctx.check_register_bounds(FC_READ_HOLDING_REGISTERS, 0xFFFF, 16, 0, 125);
        drop(ctx);
        assert_eq!(
            banks.get(&1).unwrap().holding_window(0, 16).unwrap(),
            snapshot.holding_window(0, 16).unwrap()
        );
    }
}
