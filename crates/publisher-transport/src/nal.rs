//! H.264 NAL unit handling.
//!
//! x264 emits **Annex B** streams, where NAL units are separated by
//! `00 00 01` or `00 00 00 01` start codes. FLV carries **AVCC**, where each
//! NAL unit is prefixed by its 4-byte big-endian length and the parameter
//! sets travel once, in the AVC decoder configuration record.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::TransportError;
use crate::TransportResult;

/// NAL unit types relevant for H.264.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NalUnitType {
    /// Non-IDR slice (P frame).
    NonIdrSlice = 1,
    /// IDR slice (keyframe).
    IdrSlice = 5,
    /// Supplemental Enhancement Information.
    Sei = 6,
    /// Sequence Parameter Set.
    Sps = 7,
    /// Picture Parameter Set.
    Pps = 8,
    /// Access Unit Delimiter.
    Aud = 9,
    /// Other/unknown NAL type.
    Other = 0,
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => Self::NonIdrSlice,
            5 => Self::IdrSlice,
            6 => Self::Sei,
            7 => Self::Sps,
            8 => Self::Pps,
            9 => Self::Aud,
            _ => Self::Other,
        }
    }
}

/// A single NAL unit without its start code.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_type: NalUnitType,
    /// Header byte plus payload.
    pub data: Bytes,
}

/// Offsets of every `00 00 01` start code; a preceding zero of a 4-byte
/// code is left to the previous unit and trimmed there.
fn start_codes(data: &[u8]) -> Vec<usize> {
    data.windows(3)
        .enumerate()
        .filter(|(_, w)| w[0] == 0 && w[1] == 0 && w[2] == 1)
        .map(|(i, _)| i)
        .collect()
}

/// Split an Annex B byte stream into NAL units.
pub fn parse_annex_b(data: &[u8]) -> Vec<NalUnit> {
    let codes = start_codes(data);
    let mut nals = Vec::with_capacity(codes.len());

    for (n, &code) in codes.iter().enumerate() {
        let start = code + 3;
        let end = codes.get(n + 1).copied().unwrap_or(data.len());
        let mut unit = &data[start..end.max(start)];
        // Trailing zeros belong to the next start code or are padding.
        while let [rest @ .., 0] = unit {
            unit = rest;
        }
        if let Some(&header) = unit.first() {
            nals.push(NalUnit {
                nal_type: NalUnitType::from(header),
                data: Bytes::copy_from_slice(unit),
            });
        }
    }

    nals
}

/// Prefix each NAL unit with its 4-byte big-endian length.
pub fn nals_to_avcc(nals: &[NalUnit]) -> Bytes {
    let total: usize = nals.iter().map(|nal| 4 + nal.data.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for nal in nals {
        buf.put_u32(nal.data.len() as u32);
        buf.put_slice(&nal.data);
    }
    buf.freeze()
}

/// Drop SPS, PPS and AUD units, which travel in the sequence header.
pub fn filter_parameter_sets(nals: Vec<NalUnit>) -> Vec<NalUnit> {
    nals.into_iter()
        .filter(|nal| {
            !matches!(
                nal.nal_type,
                NalUnitType::Sps | NalUnitType::Pps | NalUnitType::Aud
            )
        })
        .collect()
}

/// Convert one encoded Annex B access unit into an AVCC frame payload.
pub fn annex_b_to_avcc(data: &[u8]) -> Bytes {
    nals_to_avcc(&filter_parameter_sets(parse_annex_b(data)))
}

/// First SPS and PPS found in Annex B header data.
pub fn extract_sps_pps(annex_b_headers: &[u8]) -> Option<(Bytes, Bytes)> {
    let nals = parse_annex_b(annex_b_headers);
    let find = |wanted: NalUnitType| {
        nals.iter()
            .find(|nal| nal.nal_type == wanted)
            .map(|nal| nal.data.clone())
    };
    Some((find(NalUnitType::Sps)?, find(NalUnitType::Pps)?))
}

/// Build the AVC decoder configuration record (ISO 14496-15) carried by
/// the FLV video sequence header.
///
/// Layout: version `0x01`, profile, compatibility and level copied from
/// SPS bytes 1..4, `0xFF` (4-byte lengths), `0xE1` (one SPS), SPS length and
/// bytes, `0x01` (one PPS), PPS length and bytes.
pub fn build_avc_decoder_config(sps: &[u8], pps: &[u8]) -> TransportResult<Bytes> {
    if sps.len() < 4 {
        return Err(TransportError::Muxer(format!(
            "SPS too short: {} bytes",
            sps.len()
        )));
    }
    let too_long = |len: usize| len > u16::MAX as usize;
    if too_long(sps.len()) || too_long(pps.len()) {
        return Err(TransportError::Muxer("parameter set too long".into()));
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01);
    buf.put_slice(&sps[1..4]);
    buf.put_u8(0xFF);
    buf.put_u8(0xE1);
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(0x01);
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);

    debug!(
        sps_len = sps.len(),
        pps_len = pps.len(),
        total_len = buf.len(),
        "Built AVC decoder configuration record"
    );

    Ok(buf.freeze())
}
