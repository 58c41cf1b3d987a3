//! Single bit corruption of an operand value.

use crate::error::FaultError;
use crate::record::descriptor::InjectionDescriptor;
use crate::rng::Mt64;
use log::debug;

/// Selects the bit to flip inside an operand of `size` bytes.
///
/// In reproduce mode the recorded bit is used, otherwise the bit is drawn
/// uniformly from `[0, size * 8)`.
pub fn choose_bit(
    size: u32,
    replay: Option<&InjectionDescriptor>,
    rng: Option<&mut Mt64>,
) -> Result<u32, FaultError> {
    let bits = u64::from(size) * 8;
    let bit = match (replay, rng) {
        (Some(recorded), _) => u64::from(recorded.bit),
        (None, Some(rng)) if bits > 0 => rng.below(bits),
        // Nothing to draw from, rejected by the range check below
        (None, Some(_)) => 0,
        (None, None) => {
            return Err(FaultError::Config(
                "random bit choice without a generator".to_string(),
            ))
        }
    };
    if bit >= bits {
        return Err(FaultError::BitOutOfRange { bit, size });
    }
    let bit = u32::try_from(bit).map_err(|_| FaultError::BitOutOfRange { bit, size })?;
    debug!("Bit {} of {} selected", bit, bits);
    Ok(bit)
}

/// Flips `bit` of the little endian byte representation in `buffer`.
pub fn flip_bit(buffer: &mut [u8], bit: u32) -> Result<(), FaultError> {
    let size = buffer.len() as u32;
    let byte = buffer
        .get_mut((bit / 8) as usize)
        .ok_or(FaultError::BitOutOfRange {
            bit: u64::from(bit),
            size,
        })?;
    *byte ^= 1 << (bit % 8);
    Ok(())
}
