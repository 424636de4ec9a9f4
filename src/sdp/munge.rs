//! Opus `a=fmtp` rewriting on whole session descriptions
//!
//! The description is parsed with the SDP parser shipped by `webrtc`, the
//! fmtp line of the opus payload in the media section with the requested
//! `mid` is merged with the target parameters, and the description is
//! re-serialized. All other lines are left alone.

use std::io::Cursor;

use tracing::{debug, warn};
use webrtc::sdp::description::media::MediaDescription;
use webrtc::sdp::description::session::SessionDescription;

use super::opus::OpusCodecParameters;
use crate::error::{AppError, Result};

const OPUS_ENCODING: &str = "opus";

/// Split an fmtp config (`"minptime=10;useinbandfec=1"`) into ordered pairs.
///
/// Tokens without `=` (such as the RED `111/111` list) are kept with an empty value.
pub fn parse_fmtp_config(config: &str) -> Vec<(String, String)> {
    config
        .split(';')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| match token.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
            None => (token.to_string(), String::new()),
        })
        .collect()
}

pub fn format_fmtp_config(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| {
            if v.is_empty() {
                k.clone()
            } else {
                format!("{}={}", k, v)
            }
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// Merge `params` over an existing config. Existing keys keep their position,
/// keys the config did not have are appended.
pub fn merge_fmtp_config(existing: &str, params: &OpusCodecParameters) -> String {
    let mut pairs = parse_fmtp_config(existing);
    for (key, value) in params.to_fmtp_pairs() {
        match pairs.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => pairs.push((key.to_string(), value)),
        }
    }
    format_fmtp_config(&pairs)
}

fn parse_description(sdp: &str) -> Result<SessionDescription> {
    let mut reader = Cursor::new(sdp.as_bytes());
    SessionDescription::unmarshal(&mut reader)
        .map_err(|e| AppError::MalformedDescription(format!("Failed to parse SDP: {}", e)))
}

fn media_mid(media: &MediaDescription) -> Option<&str> {
    media
        .attributes
        .iter()
        .find(|a| a.key == "mid")
        .and_then(|a| a.value.as_deref())
}

/// Payload type announced for opus by the section's `a=rtpmap` lines.
fn opus_payload_type(media: &MediaDescription) -> Option<String> {
    media
        .attributes
        .iter()
        .filter(|a| a.key == "rtpmap")
        .filter_map(|a| a.value.as_deref())
        .find_map(|value| {
            let (pt, encoding) = value.split_once(' ')?;
            let name = encoding.split('/').next()?;
            name.eq_ignore_ascii_case(OPUS_ENCODING)
                .then(|| pt.trim().to_string())
        })
}

fn merge_into_media(media: &mut MediaDescription, mid: &str, params: &OpusCodecParameters) -> Result<()> {
    let pt = opus_payload_type(media)
        .ok_or_else(|| AppError::ParameterLineNotFound(mid.to_string()))?;
    let prefix = format!("{} ", pt);

    let fmtp = media
        .attributes
        .iter_mut()
        .filter(|a| a.key == "fmtp")
        .find(|a| a.value.as_deref().is_some_and(|v| v.starts_with(&prefix)))
        .ok_or_else(|| AppError::ParameterLineNotFound(mid.to_string()))?;

    let old_value = fmtp.value.take().unwrap_or_default();
    let config = &old_value[prefix.len()..];
    let merged = merge_fmtp_config(config, params);
    debug!("mid={} opus fmtp: '{}' -> '{}'", mid, config, merged);
    fmtp.value = Some(format!("{}{}", prefix, merged));
    Ok(())
}

fn find_media_mut<'a>(desc: &'a mut SessionDescription, mid: &str) -> Option<&'a mut MediaDescription> {
    desc.media_descriptions
        .iter_mut()
        .find(|m| media_mid(m) == Some(mid))
}

/// Rewrite the opus fmtp line of the media section `mid`.
pub fn apply_opus_parameters(sdp: &str, mid: &str, params: &OpusCodecParameters) -> Result<String> {
    let mut desc = parse_description(sdp)?;
    let media = find_media_mut(&mut desc, mid)
        .ok_or_else(|| AppError::CodecSectionNotFound(mid.to_string()))?;
    merge_into_media(media, mid, params)?;
    Ok(desc.marshal())
}

/// Apply independent parameter sets to several media sections in one pass.
///
/// Sections that cannot be rewritten are skipped and reported; the returned
/// description always carries every rewrite that succeeded. If the text
/// cannot be parsed at all it is returned unchanged.
pub fn apply_track_parameters<'a, I>(sdp: &str, tracks: I) -> (String, Vec<AppError>)
where
    I: IntoIterator<Item = (&'a str, &'a OpusCodecParameters)>,
{
    let mut desc = match parse_description(sdp) {
        Ok(desc) => desc,
        Err(e) => return (sdp.to_string(), vec![e]),
    };

    let mut skipped = Vec::new();
    let mut changed = false;
    for (mid, params) in tracks {
        if params.is_empty() {
            continue;
        }
        let result = match find_media_mut(&mut desc, mid) {
            Some(media) => merge_into_media(media, mid, params),
            None => Err(AppError::CodecSectionNotFound(mid.to_string())),
        };
        match result {
            Ok(()) => changed = true,
            Err(e) => {
                warn!("Skipping codec parameters: {}", e);
                skipped.push(e);
            }
        }
    }

    let sdp = if changed { desc.marshal() } else { sdp.to_string() };
    (sdp, skipped)
}

/// Raw fmtp pairs of the opus payload in media section `mid`.
pub fn read_fmtp_config(sdp: &str, mid: &str) -> Result<Vec<(String, String)>> {
    let desc = parse_description(sdp)?;
    let media = desc
        .media_descriptions
        .iter()
        .find(|m| media_mid(m) == Some(mid))
        .ok_or_else(|| AppError::CodecSectionNotFound(mid.to_string()))?;
    let pt = opus_payload_type(media)
        .ok_or_else(|| AppError::ParameterLineNotFound(mid.to_string()))?;
    let prefix = format!("{} ", pt);

    media
        .attributes
        .iter()
        .filter(|a| a.key == "fmtp")
        .filter_map(|a| a.value.as_deref())
        .find_map(|v| v.strip_prefix(prefix.as_str()))
        .map(parse_fmtp_config)
        .ok_or_else(|| AppError::ParameterLineNotFound(mid.to_string()))
}

/// Typed view of the opus parameters negotiated for `mid`.
pub fn read_opus_parameters(sdp: &str, mid: &str) -> Result<OpusCodecParameters> {
    let pairs = read_fmtp_config(sdp, mid)?;
    Ok(OpusCodecParameters::from_fmtp_pairs(&pairs))
}
