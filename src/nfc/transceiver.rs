use log::debug;

use crate::utils::bytes_to_string;
use crate::NfcResult;

use super::frame::{RxFrame, TxFrame};
use super::simulation::SimulatedTag;

/// The byte-framed transport under the protocol engine: a real libnfc
/// device, or the scripted tag the tests run against.
pub enum Transceiver<'context> {
    Device(nfc1::Device<'context>),
    Simulation(SimulatedTag),
}

impl Transceiver<'_> {
    /// Hand the whole frame layer to the host: no transport-side framing,
    /// CRC or parity handling. Must run before any protocol operation.
    pub fn enter_raw_mode(&mut self) -> NfcResult<()> {
        match self {
            Transceiver::Device(device) => {
                device.set_property_bool(nfc1::Property::EasyFraming, false)?;
                device.set_property_bool(nfc1::Property::HandleCrc, false)?;
                device.set_property_bool(nfc1::Property::HandleParity, false)?;
                Ok(())
            }
            Transceiver::Simulation(_) => Ok(()),
        }
    }

    pub fn transceive_bits(&mut self, frame: &TxFrame) -> NfcResult<RxFrame> {
        debug!(
            "> {} bits: {}",
            frame.bits,
            bytes_to_string(&frame.data)
        );

        let reply = match self {
            Transceiver::Device(device) => {
                let (data, bits) = device.initiator_transceive_bits(&frame.data, frame.bits, None)?;
                RxFrame::from_raw(&data, bits)
            }
            Transceiver::Simulation(tag) => tag.transceive(frame)?,
        };

        debug!("< {} bytes", reply.len());
        Ok(reply)
    }
}
