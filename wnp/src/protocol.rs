// The text and binary sub-protocol spoken with the browser extension over
// the WebSocket transport.
//
// Browser -> library, text:
//   "0 <port> <fields>"   PLAYER_ADDED
//   "1 <port> <fields>"   PLAYER_UPDATED
//   "2 <port>"            PLAYER_REMOVED
//   "3 <event> <result>"  EVENT_RESULT
//
// `<port>` is the extension's own id for a tab, unique only within one
// connection. Tokens are split on single spaces the way `strtok` would:
// leading spaces before a token are skipped and the last token takes the
// rest of the line. Numbers parse like `atoi`, so "12abc" is 12 and garbage
// is 0; nothing here rejects a message for a malformed number.
//
// `<fields>` is a run of `|`-terminated fields in `FIELD_COUNT` fixed
// positions (see `apply_fields`). `\|` inside a field is a literal pipe. An
// empty field leaves the player's value alone, and a string field starting
// with byte 0x01 sets the empty string. A trailing field without its `|` is
// dropped, as is anything past the last position.
//
// Browser -> library, binary: 4-byte little-endian port id, then raw cover
// image bytes (`split_cover`).
//
// Library -> browser: a greeting on open (`greeting`) and one text message
// per control event (`format_event`).

use crate::error::ProtocolError;
use crate::events::{EventId, EventKind};
use crate::player::{
    PlaybackState, Player, RatingSystem, Repeat, RepeatModes, truncate_bounded,
};

/// Sub-protocol revision announced in the greeting.
pub const WNPLIB_REVISION: u32 = 3;

/// Number of positional fields in a player record.
pub const FIELD_COUNT: usize = 26;

/// Prefix byte marking an explicitly empty string field.
pub const EMPTY_MARKER: char = '\u{1}';

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientMessage<'a> {
    PlayerAdded { port_id: i64, fields: &'a str },
    PlayerUpdated { port_id: i64, fields: &'a str },
    PlayerRemoved { port_id: i64 },
    EventResult { event_id: i64, result: i64 },
}

impl<'a> ClientMessage<'a> {
    pub fn parse(text: &'a str) -> Result<Self, ProtocolError> {
        let (kind, rest) = next_token(text).ok_or(ProtocolError::Empty)?;
        let missing = |kind, field| ProtocolError::MissingField { kind, field };

        match atoi(kind) {
            0 | 1 => {
                let name = if atoi(kind) == 0 { "PLAYER_ADDED" } else { "PLAYER_UPDATED" };
                let (port, fields) = next_token(rest).ok_or(missing(name, "port id"))?;
                if fields.is_empty() {
                    return Err(missing(name, "fields"));
                }
                let port_id = atoi(port);
                Ok(if atoi(kind) == 0 {
                    Self::PlayerAdded { port_id, fields }
                } else {
                    Self::PlayerUpdated { port_id, fields }
                })
            }
            2 => {
                if rest.is_empty() {
                    return Err(missing("PLAYER_REMOVED", "port id"));
                }
                Ok(Self::PlayerRemoved { port_id: atoi(rest) })
            }
            3 => {
                let (event, result) =
                    next_token(rest).ok_or(missing("EVENT_RESULT", "event id"))?;
                if result.is_empty() {
                    return Err(missing("EVENT_RESULT", "result"));
                }
                Ok(Self::EventResult {
                    event_id: atoi(event),
                    result: atoi(result),
                })
            }
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Split off the next space-delimited token. The remainder starts just past
/// the single delimiter and keeps any further spaces.
fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start_matches(' ');
    if s.is_empty() {
        return None;
    }
    Some(match s.find(' ') {
        Some(end) => (&s[..end], &s[end + 1..]),
        None => (s, ""),
    })
}

/// C `atoi`: optional leading whitespace and sign, then digits up to the
/// first non-digit. Saturates instead of overflowing.
pub fn atoi(s: &str) -> i64 {
    let s = s.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        let digit = i64::from(b - b'0');
        value = value.saturating_mul(10).saturating_add(digit);
    }
    if negative { value.saturating_neg() } else { value }
}

fn to_u32(n: i64) -> u32 {
    u32::try_from(n.max(0)).unwrap_or(u32::MAX)
}

fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn clamp_u8(n: i64, max: u8) -> u8 {
    u8::try_from(n.clamp(0, i64::from(max))).unwrap_or(max)
}

/// Split a `|`-terminated field list into at most `FIELD_COUNT` unescaped
/// fields.
fn split_fields(data: &str) -> Vec<String> {
    let bytes = data.as_bytes();
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() && fields.len() < FIELD_COUNT {
        match bytes[i] {
            b'\\' if bytes.get(i + 1) == Some(&b'|') => i += 2,
            b'|' => {
                fields.push(data[start..i].replace("\\|", "|"));
                start = i + 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    fields
}

fn assign_str(dest: &mut String, token: &str) {
    if token.starts_with(EMPTY_MARKER) {
        dest.clear();
    } else {
        *dest = token.to_owned();
        truncate_bounded(dest);
    }
}

/// Apply a field list to `player`. Returns the port id carried in field 0,
/// if present.
///
/// Values out of range are clamped; enum codes that name no variant leave
/// the field unchanged.
pub fn apply_fields(player: &mut Player, data: &str) -> Option<i64> {
    let mut port_id = None;

    for (index, token) in split_fields(data).iter().enumerate() {
        if token.is_empty() {
            continue;
        }
        let n = atoi(token);
        match index {
            0 => port_id = Some(n),
            1 => assign_str(&mut player.name, token),
            2 => assign_str(&mut player.title, token),
            3 => assign_str(&mut player.artist, token),
            4 => assign_str(&mut player.album, token),
            5 => assign_str(&mut player.cover_src, token),
            6 => {
                if let Some(state) = PlaybackState::from_code(n) {
                    player.state = state;
                }
            }
            7 => player.position = to_u32(n),
            8 => player.duration = to_u32(n),
            9 => player.volume = clamp_u8(n, 100),
            10 => player.rating = clamp_u8(n, 5),
            11 => {
                if let Some(repeat) = Repeat::from_code(n) {
                    player.repeat = repeat;
                }
            }
            12 => player.shuffle = n != 0,
            13 => {
                if let Some(system) = RatingSystem::from_code(n) {
                    player.rating_system = system;
                }
            }
            14 => player.available_repeat = RepeatModes::from_bits_truncate((n & 0xFF) as u8),
            15..=22 => {
                let flags = player.capabilities.flags_mut();
                if let Some(flag) = flags.into_iter().nth(index - 15) {
                    *flag = n != 0;
                }
            }
            23 => player.created_at = to_u64(n),
            24 => player.updated_at = to_u64(n),
            25 => player.active_at = to_u64(n),
            _ => {}
        }
    }

    port_id
}

fn push_str_field(out: &mut String, value: &str) {
    if value.is_empty() {
        out.push(EMPTY_MARKER);
    } else {
        out.push_str(&value.replace('|', "\\|"));
    }
    out.push('|');
}

fn push_num_field(out: &mut String, value: impl std::fmt::Display) {
    out.push_str(&value.to_string());
    out.push('|');
}

/// Encode every field of `player`, the way the browser extension does.
/// A string ending in a backslash cannot be represented faithfully.
pub fn encode_fields(player: &Player, port_id: i64) -> String {
    let mut out = String::new();
    push_num_field(&mut out, port_id);
    for value in [
        &player.name,
        &player.title,
        &player.artist,
        &player.album,
        &player.cover_src,
    ] {
        push_str_field(&mut out, value);
    }
    push_num_field(&mut out, player.state.code());
    push_num_field(&mut out, player.position);
    push_num_field(&mut out, player.duration);
    push_num_field(&mut out, player.volume);
    push_num_field(&mut out, player.rating);
    push_num_field(&mut out, player.repeat.code());
    push_num_field(&mut out, u8::from(player.shuffle));
    push_num_field(&mut out, player.rating_system.code());
    push_num_field(&mut out, player.available_repeat.bits());
    for flag in player.capabilities.as_array() {
        push_num_field(&mut out, u8::from(flag));
    }
    push_num_field(&mut out, player.created_at);
    push_num_field(&mut out, player.updated_at);
    push_num_field(&mut out, player.active_at);
    out
}

/// Text sent to a browser connection right after the handshake.
pub fn greeting(adapter_version: &str) -> String {
    format!("ADAPTER_VERSION {adapter_version},WNPLIB_REVISION {WNPLIB_REVISION}")
}

/// Text asking the browser to perform a control action.
pub fn format_event(port_id: i64, event_id: EventId, kind: EventKind, data: i64) -> String {
    format!("{port_id} {} {} {data}", event_id.0, kind.code())
}

/// Split a binary cover message into its port id and image bytes.
pub fn split_cover(message: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    match message {
        [a, b, c, d, image @ ..] => Ok((u32::from_le_bytes([*a, *b, *c, *d]), image)),
        _ => Err(ProtocolError::ShortBinary(message.len())),
    }
}

/// Plain `MAJOR.MINOR.PATCH`, digits only.
pub fn is_valid_adapter_version(version: &str) -> bool {
    semver::Version::parse(version).is_ok_and(|v| v.pre.is_empty() && v.build.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::Capabilities;

    const SAMPLE: &str = "8|PlayerName|Title with \\| pipe||\u{1}|https://some.url/|1|5|267|3|5|2|1|1|7|1|1|1|1|1|1|1|1|1702093090496|1702093090497|1702093090497|";

    #[test]
    fn sample_record_decodes() {
        let mut p = Player {
            artist: "kept".into(),
            album: "gone".into(),
            ..Player::default()
        };
        let port = apply_fields(&mut p, SAMPLE);
        assert_eq!(port, Some(8));
        assert_eq!(p.name, "PlayerName");
        assert_eq!(p.title, "Title with | pipe");
        assert_eq!(p.artist, "kept");
        assert_eq!(p.album, "");
        assert_eq!(p.cover_src, "https://some.url/");
        assert_eq!(p.state, PlaybackState::Paused);
        assert_eq!(p.position, 5);
        assert_eq!(p.duration, 267);
        assert_eq!(p.volume, 3);
        assert_eq!(p.rating, 5);
        assert_eq!(p.repeat, Repeat::All);
        assert!(p.shuffle);
        assert_eq!(p.rating_system, RatingSystem::Like);
        assert_eq!(p.available_repeat, RepeatModes::all());
        assert_eq!(p.capabilities, Capabilities::ALL);
        assert_eq!(p.created_at, 1702093090496);
        assert_eq!(p.updated_at, 1702093090497);
        assert_eq!(p.active_at, 1702093090497);
    }

    #[test]
    fn trailing_unterminated_field_is_ignored() {
        let mut p = Player::default();
        apply_fields(&mut p, "1|name|title");
        assert_eq!(p.name, "name");
        assert_eq!(p.title, "");
    }

    #[test]
    fn extra_fields_beyond_the_record_are_ignored() {
        let mut p = Player::default();
        let data = format!("{}999|", "|".repeat(FIELD_COUNT));
        apply_fields(&mut p, &data);
        assert_eq!(p, Player::default());
    }

    #[test]
    fn out_of_range_values_are_clamped_or_ignored() {
        let mut p = Player::default();
        apply_fields(&mut p, "||||||9|-4||250|17|3|");
        assert_eq!(p.state, PlaybackState::Stopped, "unknown code keeps value");
        assert_eq!(p.position, 0);
        assert_eq!(p.volume, 100);
        assert_eq!(p.rating, 5);
        assert_eq!(p.repeat, Repeat::None);
    }

    #[test]
    fn garbage_does_not_panic() {
        let mut p = Player::default();
        for junk in ["", "|", "\\", "\\|", "||\\", "€|€€|\u{1}|", "abc|def|-|+|99999999999999999999999|"] {
            apply_fields(&mut p, junk);
            let _ = ClientMessage::parse(junk);
        }
    }

    #[test]
    fn encode_then_apply_reproduces_record() {
        let original = Player {
            name: "Tab".into(),
            title: "a|b".into(),
            artist: String::new(),
            state: PlaybackState::Playing,
            position: 30,
            duration: 200,
            volume: 40,
            repeat: Repeat::One,
            available_repeat: RepeatModes::NONE | RepeatModes::ONE,
            capabilities: Capabilities {
                can_skip_next: true,
                ..Capabilities::default()
            },
            created_at: 1,
            updated_at: 2,
            active_at: 3,
            ..Player::default()
        };
        let mut decoded = Player {
            artist: "stale".into(),
            ..Player::default()
        };
        assert_eq!(apply_fields(&mut decoded, &encode_fields(&original, 12)), Some(12));
        assert_eq!(decoded, original);
    }

    #[test]
    fn parses_message_types() {
        assert_eq!(
            ClientMessage::parse("0 5 1|n|"),
            Ok(ClientMessage::PlayerAdded { port_id: 5, fields: "1|n|" })
        );
        assert_eq!(
            ClientMessage::parse("1  7 x y|"),
            Ok(ClientMessage::PlayerUpdated { port_id: 7, fields: "x y|" })
        );
        assert_eq!(
            ClientMessage::parse("2 9"),
            Ok(ClientMessage::PlayerRemoved { port_id: 9 })
        );
        assert_eq!(
            ClientMessage::parse("3 17 1"),
            Ok(ClientMessage::EventResult { event_id: 17, result: 1 })
        );
    }

    #[test]
    fn rejects_incomplete_messages() {
        assert_eq!(ClientMessage::parse("   "), Err(ProtocolError::Empty));
        assert_eq!(ClientMessage::parse("4 1"), Err(ProtocolError::UnknownType(4)));
        assert!(matches!(
            ClientMessage::parse("0 5"),
            Err(ProtocolError::MissingField { field: "fields", .. })
        ));
        assert!(matches!(
            ClientMessage::parse("2"),
            Err(ProtocolError::MissingField { kind: "PLAYER_REMOVED", .. })
        ));
        assert!(matches!(
            ClientMessage::parse("3 17"),
            Err(ProtocolError::MissingField { field: "result", .. })
        ));
    }

    #[test]
    fn atoi_matches_c() {
        assert_eq!(atoi("42"), 42);
        assert_eq!(atoi("  -7x"), -7);
        assert_eq!(atoi("+3"), 3);
        assert_eq!(atoi("abc"), 0);
        assert_eq!(atoi(""), 0);
        assert_eq!(atoi("99999999999999999999999"), i64::MAX);
    }

    #[test]
    fn outgoing_messages() {
        assert_eq!(greeting("1.2.3"), "ADAPTER_VERSION 1.2.3,WNPLIB_REVISION 3");
        assert_eq!(format_event(8, EventId(12), EventKind::SetVolume, 55), "8 12 4 55");
    }

    #[test]
    fn cover_messages_carry_little_endian_port() {
        let (port, image) = split_cover(&[3, 1, 0, 0, 0x89, b'P']).unwrap();
        assert_eq!(port, 259);
        assert_eq!(image, &[0x89, b'P']);
        assert_eq!(split_cover(&[1, 2, 3]), Err(ProtocolError::ShortBinary(3)));
        assert_eq!(split_cover(&[1, 0, 0, 0]).unwrap(), (1, &[][..]));
    }

    #[test]
    fn adapter_version_validation() {
        assert!(is_valid_adapter_version("1.0.0"));
        assert!(is_valid_adapter_version("10.20.30"));
        for bad in ["a1.0.0", "1.a.0.1", "1.0.0.0", "1..01", "1.0", "1.0.0-beta", "1.0.0+b1", ""] {
            assert!(!is_valid_adapter_version(bad), "{bad}");
        }
    }
}
