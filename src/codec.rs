//! Pure parsers for the AT text dialect.
//!
//! Everything here is I/O-free: inputs are the raw response strings produced
//! by the serial transport, outputs are typed records. Covers `+CMGL`,
//! `+CMGR`, `+CMTI`, `+CUSD` and `+CNUM` framing, plus the UCS-2 helpers
//! shared by the SMS and USSD paths (the modem runs in `CSCS="UCS2"` mode,
//! so senders and bodies may arrive as hex-encoded UTF-16BE).

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// One stored SMS as reported in text mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sms {
    /// Storage index in the selected memory.
    pub index: u32,
    /// Free-form status string, e.g. `REC UNREAD`.
    pub status: String,
    /// Originating address; may still be UCS-2 hex.
    pub sender: String,
    /// Service-center timestamp, verbatim from the modem.
    pub timestamp: String,
    /// Decoded message body.
    pub text: String,
}

/// Parsed `+CUSD` reply. Fields the modem omitted (or that failed to parse)
/// are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UssdReply {
    pub mode: Option<u32>,
    pub text: Option<String>,
    pub dcs: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("no +CMGR header in response")]
    MissingHeader,
    #[error("malformed +CMGR header: {0:?}")]
    MalformedHeader(String),
    #[error("+CMGR response has no body line")]
    MissingBody,
    #[error("malformed +CMTI line: {0:?}")]
    MalformedCmti(String),
}

static CMGL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\+CMGL:\s*(\d+)\s*,\s*"([^"]*)"\s*,\s*"([^"]*)"\s*,\s*"([^"]*)"\s*,\s*"([^"]*)"\s*$"#)
        .expect("CMGL pattern")
});

static CMGR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\+CMGR:\s*"([^"]*)"\s*,\s*"([^"]*)"\s*,.*,\s*"([^"]*)"\s*$"#)
        .expect("CMGR pattern")
});

static CUSD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\+CUSD:\s*(\d+)\s*,\s*"([^"]*)"(?:\s*,\s*(\d+))?"#).expect("CUSD pattern")
});

static CNUM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\+CNUM:\s*(?:"[^"]*"\s*,)?\s*"?(\+?\d{8,15})"?"#).expect("CNUM pattern")
});

static MSISDN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(0\d{9,10}|\+84\d{9})").expect("MSISDN pattern"));

/// Parse a `AT+CMGL` listing into messages, in source order.
///
/// Each `+CMGL:` header owns the following lines as its body, up to the next
/// header or a bare `OK`/`ERROR` sentinel.
pub fn parse_cmgl(resp: &str) -> Vec<Sms> {
    let lines: Vec<&str> = resp.lines().map(|l| l.trim_end_matches('\r')).collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if let Some(caps) = CMGL_RE.captures(lines[i]) {
            if let Ok(index) = caps[1].parse::<u32>() {
                let mut j = i + 1;
                let mut body = Vec::new();
                while j < lines.len() {
                    let next = lines[j];
                    if next.starts_with("+CMGL:") || next == "OK" || next.starts_with("ERROR") {
                        break;
                    }
                    body.push(next);
                    j += 1;
                }
                out.push(Sms {
                    index,
                    status: caps[2].to_string(),
                    sender: caps[3].to_string(),
                    timestamp: caps[5].to_string(),
                    text: body.join("\n").trim().to_string(),
                });
                i = j;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Parse a `AT+CMGR=<index>` response.
///
/// The first two non-empty lines are header and body; the body is UCS-2
/// decoded when it is a clean hex rendition of UTF-16BE.
pub fn parse_cmgr(resp: &str, index: u32) -> Result<Sms, CodecError> {
    let mut lines = resp
        .lines()
        .map(|l| l.trim_end_matches('\r').trim())
        .filter(|l| !l.is_empty());
    let header = lines.next().ok_or(CodecError::MissingHeader)?;
    let caps = CMGR_RE
        .captures(header)
        .ok_or_else(|| CodecError::MalformedHeader(header.to_string()))?;
    let body = lines.next().ok_or(CodecError::MissingBody)?;
    Ok(Sms {
        index,
        status: caps[1].to_string(),
        sender: caps[2].to_string(),
        timestamp: caps[3].to_string(),
        text: decode_ucs2_if_hex(body),
    })
}

/// Extract the storage index from a `+CMTI: "<mem>",<index>` URC.
pub fn parse_cmti(line: &str) -> Result<u32, CodecError> {
    line.split(',')
        .nth(1)
        .and_then(|field| field.trim().parse().ok())
        .ok_or_else(|| CodecError::MalformedCmti(line.to_string()))
}

/// Parse the first `+CUSD:` occurrence anywhere in `resp`.
pub fn parse_cusd(resp: &str) -> UssdReply {
    let Some(caps) = CUSD_RE.captures(resp) else {
        return UssdReply::default();
    };
    UssdReply {
        mode: caps.get(1).and_then(|m| m.as_str().parse().ok()),
        text: caps.get(2).map(|m| m.as_str().to_string()),
        dcs: caps.get(3).and_then(|m| m.as_str().parse().ok()),
    }
}

/// Subscriber number from a `AT+CNUM` response: first line carrying an
/// optional `+` and 8–15 digits, quoted or not.
pub fn parse_cnum(resp: &str) -> Option<String> {
    resp.lines()
        .find_map(|line| CNUM_RE.captures(line.trim()).map(|c| c[1].to_string()))
}

/// Decode `s` as hex-encoded UTF-16BE when it cleanly is one; otherwise
/// return it unchanged.
pub fn decode_ucs2_if_hex(s: &str) -> String {
    try_decode_ucs2(s).unwrap_or_else(|| s.to_string())
}

fn try_decode_ucs2(s: &str) -> Option<String> {
    if s.is_empty() || s.len() % 4 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let units = (0..s.len())
        .step_by(4)
        .map(|i| u16::from_str_radix(&s[i..i + 4], 16).ok())
        .collect::<Option<Vec<u16>>>()?;
    String::from_utf16(&units).ok()
}

/// Normalize a USSD payload: DCS values 8, 15 and 72 mark UCS-2 hex, which
/// is decoded and trimmed; anything else is trimmed as-is.
pub fn normalize_ussd(text: &str, dcs: Option<u32>) -> String {
    if text.is_empty() {
        return String::new();
    }
    if matches!(dcs, Some(8 | 15 | 72)) && text.bytes().all(|b| b.is_ascii_hexdigit()) {
        if let Some(decoded) = try_decode_ucs2(text) {
            return decoded.trim().to_string();
        }
        return text.to_string();
    }
    text.trim().to_string()
}

/// First Vietnamese-format subscriber number in `text`: a local `0`-prefixed
/// 10–11 digit run or an international `+84` one.
pub fn extract_msisdn(text: &str) -> Option<String> {
    MSISDN_RE.captures(text).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_cmgl(msgs: &[Sms]) -> String {
        let mut out = String::new();
        for m in msgs {
            out.push_str(&format!(
                "+CMGL: {},\"{}\",\"{}\",\"\",\"{}\"\r\n{}\r\n",
                m.index, m.status, m.sender, m.timestamp, m.text
            ));
        }
        out.push_str("OK\r\n");
        out
    }

    #[test]
    fn cmgl_single_message() {
        let resp = "+CMGL: 3,\"REC UNREAD\",\"VCB\",\"\",\"25/01/10,12:34:56+28\"\r\nMa OTP: 482913 co hieu luc 2p.\r\nOK\r\n";
        let msgs = parse_cmgl(resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].index, 3);
        assert_eq!(msgs[0].status, "REC UNREAD");
        assert_eq!(msgs[0].sender, "VCB");
        assert_eq!(msgs[0].timestamp, "25/01/10,12:34:56+28");
        assert_eq!(msgs[0].text, "Ma OTP: 482913 co hieu luc 2p.");
    }

    #[test]
    fn cmgl_multiline_body_and_second_header() {
        let resp = "+CMGL: 1,\"REC READ\",\"VCB\",\"\",\"25/01/10,12:00:00+28\"\r\nline one\r\nline two\r\n+CMGL: 2,\"REC UNREAD\",\"TCB\",\"\",\"25/01/10,12:01:00+28\"\r\nsecond\r\nOK\r\n";
        let msgs = parse_cmgl(resp);
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].text, "line one\nline two");
        assert_eq!(msgs[1].index, 2);
        assert_eq!(msgs[1].sender, "TCB");
        assert_eq!(msgs[1].text, "second");
    }

    #[test]
    fn cmgl_ignores_noise_and_error_sentinel() {
        assert!(parse_cmgl("garbage\r\nERROR\r\n").is_empty());
        let resp = "+CMGL: 5,\"REC UNREAD\",\"X\",\"\",\"ts\"\r\nbody\r\nERROR\r\n";
        let msgs = parse_cmgl(resp);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].text, "body");
    }

    #[test]
    fn cmgl_round_trips_rendered_messages() {
        let msgs = vec![
            Sms {
                index: 0,
                status: "REC UNREAD".to_string(),
                sender: "VCB".to_string(),
                timestamp: "25/01/10,12:34:56+28".to_string(),
                text: "Ma OTP: 482913".to_string(),
            },
            Sms {
                index: 12,
                status: "REC READ".to_string(),
                sender: "+84912345678".to_string(),
                timestamp: "25/02/01,00:00:01+28".to_string(),
                text: "Thank you for your purchase.".to_string(),
            },
        ];
        assert_eq!(parse_cmgl(&render_cmgl(&msgs)), msgs);
    }

    #[test]
    fn cmgr_plain_body() {
        let resp = "+CMGR: \"REC UNREAD\",\"VCB\",\"\",,\"25/01/10,12:34:56+28\"\r\nMa OTP: 482913 co hieu luc 2p.\r\nOK\r\n";
        let sms = parse_cmgr(resp, 7).unwrap();
        assert_eq!(sms.index, 7);
        assert_eq!(sms.status, "REC UNREAD");
        assert_eq!(sms.sender, "VCB");
        assert_eq!(sms.timestamp, "25/01/10,12:34:56+28");
        assert_eq!(sms.text, "Ma OTP: 482913 co hieu luc 2p.");
    }

    #[test]
    fn cmgr_decodes_ucs2_body() {
        // "Mã 482913 co" as UTF-16BE hex
        let resp = "+CMGR: \"REC UNREAD\",\"VCB\",\"\",,\"25/01/10,12:34:56+28\"\r\n004D00E3002000340038003200390031003300200063006F\r\nOK\r\n";
        let sms = parse_cmgr(resp, 9).unwrap();
        assert_eq!(sms.text, "Mã 482913 co");
    }

    #[test]
    fn cmgr_rejects_malformed_responses() {
        assert_eq!(parse_cmgr("", 1), Err(CodecError::MissingHeader));
        assert!(matches!(
            parse_cmgr("+CME ERROR: 321\r\n", 1),
            Err(CodecError::MalformedHeader(_))
        ));
        let bodyless = "+CMGR: \"REC UNREAD\",\"VCB\",\"\",,\"ts\"\r\n";
        assert_eq!(parse_cmgr(bodyless, 1), Err(CodecError::MissingBody));
    }

    #[test]
    fn cmti_index() {
        assert_eq!(parse_cmti("+CMTI: \"SM\",12"), Ok(12));
        assert_eq!(parse_cmti("+CMTI: \"SM\", 7"), Ok(7));
        assert!(parse_cmti("+CMTI: \"SM\"").is_err());
        assert!(parse_cmti("+CMTI: \"SM\",x").is_err());
    }

    #[test]
    fn cusd_with_and_without_dcs() {
        let full = parse_cusd("OK\r\n+CUSD: 0,\"So TB 0912345678 cua ban\",15\r\n");
        assert_eq!(full.mode, Some(0));
        assert_eq!(full.text.as_deref(), Some("So TB 0912345678 cua ban"));
        assert_eq!(full.dcs, Some(15));

        let bare = parse_cusd("+CUSD: 2,\"done\"");
        assert_eq!(bare.dcs, None);
        assert_eq!(bare.text.as_deref(), Some("done"));

        assert_eq!(parse_cusd("OK\r\n"), UssdReply::default());
    }

    #[test]
    fn cnum_variants() {
        assert_eq!(
            parse_cnum("+CNUM: \"line1\",\"+84912345678\",145\r\nOK").as_deref(),
            Some("+84912345678")
        );
        assert_eq!(
            parse_cnum("+CNUM: \"0912345678\",129").as_deref(),
            Some("0912345678")
        );
        assert_eq!(parse_cnum("OK\r\n"), None);
        // Too short to be a subscriber number.
        assert_eq!(parse_cnum("+CNUM: \"\",\"123\",129"), None);
    }

    #[test]
    fn ucs2_decodes_clean_hex() {
        assert_eq!(decode_ucs2_if_hex("004D00E3"), "Mã");
        // lowercase hex decodes too
        assert_eq!(decode_ucs2_if_hex("004d00e3"), "Mã");
    }

    #[test]
    fn ucs2_passes_through_non_hex_and_ragged_input() {
        assert_eq!(decode_ucs2_if_hex("Ma OTP: 482913"), "Ma OTP: 482913");
        assert_eq!(decode_ucs2_if_hex(""), "");
        // even hex length but not a whole number of UTF-16 units
        assert_eq!(decode_ucs2_if_hex("004D00"), "004D00");
        // unpaired surrogate does not decode
        assert_eq!(decode_ucs2_if_hex("D800"), "D800");
    }

    #[test]
    fn normalize_ussd_decodes_only_ucs2_dcs() {
        assert_eq!(
            normalize_ussd("004D00E3002000340038003200390031003300200063006F", Some(72)),
            "Mã 482913 co"
        );
        assert_eq!(normalize_ussd("  plain text  ", Some(15)), "plain text");
        assert_eq!(normalize_ussd("004D00E3", None), "004D00E3");
        assert_eq!(normalize_ussd("", Some(15)), "");
    }

    #[test]
    fn msisdn_extraction() {
        assert_eq!(
            extract_msisdn("So TB 0912345678 cua ban").as_deref(),
            Some("0912345678")
        );
        assert_eq!(
            extract_msisdn("lien he +84912345678 ngay").as_deref(),
            Some("+84912345678")
        );
        assert_eq!(extract_msisdn("no number here"), None);
    }
}
