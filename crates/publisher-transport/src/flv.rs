//! FLV tag payloads, AAC configuration and `onMetaData`.

use bytes::{BufMut, Bytes, BytesMut};

/// FLV tag types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlvTagKind {
    Audio = 8,
    Video = 9,
    Script = 18,
}

/// One FLV tag ready for a sink.
#[derive(Debug, Clone)]
pub struct FlvTag {
    pub kind: FlvTagKind,
    /// Decode timestamp in milliseconds.
    pub timestamp_ms: u32,
    /// Tag body, including the codec header bytes.
    pub body: Bytes,
    /// Keyframe or sequence header; never droppable.
    pub keyframe: bool,
}

/// FLV `SoundFormat=10 (AAC), 44 kHz, 16-bit, stereo`. AAC tags always
/// carry this header; the real format is in the AudioSpecificConfig.
const AAC_AUDIO_HEADER: u8 = 0xAF;

/// Build an FLV video tag body for H.264 data.
///
/// Byte 0 is frame type (1 key, 2 inter) and codec id 7 (AVC). Byte 1 is
/// the AVC packet type (0 sequence header, 1 NALU). Bytes 2..5 are the
/// signed 24-bit composition time offset (PTS - DTS).
pub fn build_flv_video_tag(
    data: &[u8],
    is_keyframe: bool,
    is_sequence_header: bool,
    composition_time: i32,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    let frame_type = if is_keyframe { 0x10 } else { 0x20 };
    buf.put_u8(frame_type | 0x07);
    buf.put_u8(if is_sequence_header { 0x00 } else { 0x01 });
    let ct = composition_time.clamp(-(1 << 23), (1 << 23) - 1) as u32;
    buf.put_uint(u64::from(ct & 0x00FF_FFFF), 3);
    buf.put_slice(data);
    buf.freeze()
}

/// Build an FLV audio tag body for AAC data.
pub fn build_flv_audio_tag(data: &[u8], is_sequence_header: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + data.len());
    buf.put_u8(AAC_AUDIO_HEADER);
    buf.put_u8(if is_sequence_header { 0x00 } else { 0x01 });
    buf.put_slice(data);
    buf.freeze()
}

/// MPEG-4 sampling frequency index of `rate`.
pub fn sampling_frequency_index(rate: u32) -> Option<u8> {
    const RATES: [u32; 12] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000,
    ];
    RATES.iter().position(|&r| r == rate).map(|i| i as u8)
}

/// Two-byte AAC-LC AudioSpecificConfig: 5 bits object type (2), 4 bits
/// frequency index, 4 bits channel configuration, 3 zero bits.
pub fn audio_specific_config(sample_rate: u32, channels: u8) -> Option<[u8; 2]> {
    const AAC_LC: u8 = 2;
    let index = sampling_frequency_index(sample_rate)?;
    if channels == 0 || channels > 7 {
        return None;
    }
    Some([
        (AAC_LC << 3) | (index >> 1),
        ((index & 0x01) << 7) | (channels << 3),
    ])
}

/// Stream description sent ahead of media as `onMetaData`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlvMetadata {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub video_bitrate_kbps: u32,
    /// Audio parameters when an audio stream exists.
    pub audio: Option<AudioMetadata>,
    pub encoder: String,
}

/// Audio half of [`FlvMetadata`].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioMetadata {
    pub sample_rate: u32,
    pub channels: u32,
    pub bitrate_kbps: u32,
}

/// FLV codec id of AVC.
pub const VIDEO_CODEC_ID_AVC: u32 = 7;

/// FLV sound format id of AAC.
pub const AUDIO_CODEC_ID_AAC: u32 = 10;

enum Amf0<'a> {
    Number(f64),
    Bool(bool),
    String(&'a str),
}

impl FlvMetadata {
    /// AMF0 body of the script tag: the string `onMetaData` followed by an
    /// ECMA array of the stream properties.
    pub fn to_script_body(&self) -> Bytes {
        let mut props: Vec<(&str, Amf0<'_>)> = vec![
            ("duration", Amf0::Number(0.0)),
            ("width", Amf0::Number(self.width as f64)),
            ("height", Amf0::Number(self.height as f64)),
            ("videodatarate", Amf0::Number(self.video_bitrate_kbps as f64)),
            ("framerate", Amf0::Number(self.frame_rate)),
            ("videocodecid", Amf0::Number(VIDEO_CODEC_ID_AVC as f64)),
        ];
        if let Some(audio) = &self.audio {
            props.extend([
                ("audiodatarate", Amf0::Number(audio.bitrate_kbps as f64)),
                ("audiosamplerate", Amf0::Number(audio.sample_rate as f64)),
                ("audiosamplesize", Amf0::Number(16.0)),
                ("stereo", Amf0::Bool(audio.channels > 1)),
                ("audiocodecid", Amf0::Number(AUDIO_CODEC_ID_AAC as f64)),
            ]);
        }
        props.push(("encoder", Amf0::String(&self.encoder)));
        props.push(("filesize", Amf0::Number(0.0)));

        let mut buf = BytesMut::new();
        put_amf_string(&mut buf, "onMetaData");
        buf.put_u8(0x08);
        buf.put_u32(props.len() as u32);
        for (key, value) in props {
            put_utf8(&mut buf, key);
            match value {
                Amf0::Number(n) => {
                    buf.put_u8(0x00);
                    buf.put_f64(n);
                }
                Amf0::Bool(b) => {
                    buf.put_u8(0x01);
                    buf.put_u8(b as u8);
                }
                Amf0::String(s) => put_amf_string(&mut buf, s),
            }
        }
        // Object end marker.
        buf.put_slice(&[0x00, 0x00, 0x09]);
        buf.freeze()
    }
}

fn put_utf8(buf: &mut BytesMut, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn put_amf_string(buf: &mut BytesMut, s: &str) {
    buf.put_u8(0x02);
    put_utf8(buf, s);
}
