// Event XML parsing.
//
// A rendered 4625 event looks like:
//
//   <Event xmlns='http://schemas.microsoft.com/win/2004/08/events/event'>
//     <System>
//       <TimeCreated SystemTime='2026-02-21T16:42:04.7999016Z'/>
//       ...
//     </System>
//     <EventData>
//       <Data Name='TargetUserName'>administrator</Data>
//       <Data Name='IpAddress'>203.0.113.10</Data>
//       <Data Name='IpPort'>49152</Data>
//       ...
//     </EventData>
//   </Event>
//
// Only a handful of named fields are needed, so a lightweight scanner
// beats a full XML parser here. Rendered event XML is machine-generated
// and well-formed; a field that cannot be found is simply absent.

use secmon_core::{event_fingerprint, is_ignored_source, utc_to_local, FailedLoginEvent};

/// A parsed event plus the raw UTC string needed for fingerprinting.
/// The raw string never leaves the process.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    raw_utc: String,
    pub event: FailedLoginEvent,
}

impl ParsedEvent {
    /// Dedup fingerprint over the raw UTC time and natural-key fields.
    pub fn fingerprint(&self) -> String {
        event_fingerprint(
            &self.raw_utc,
            &self.event.ip_address,
            self.event.username.as_deref().unwrap_or(""),
            self.event.source_port.as_deref().unwrap_or(""),
        )
    }

    /// True when the source address is loopback/placeholder noise.
    pub fn is_noise(&self) -> bool {
        is_ignored_source(&self.event.ip_address)
    }
}

/// Parse one rendered event. Returns None when the XML is missing the
/// SystemTime attribute — without it there is nothing to fingerprint.
pub fn parse_event_xml(xml: &str) -> Option<ParsedEvent> {
    let raw_utc = extract_attr(xml, "TimeCreated", "SystemTime")?;

    let ip_address = extract_data_field(xml, "IpAddress").unwrap_or_else(|| "-".to_string());

    let event = FailedLoginEvent {
        timestamp: utc_to_local(&raw_utc),
        ip_address,
        username: extract_data_field(xml, "TargetUserName"),
        domain: extract_data_field(xml, "TargetDomainName"),
        logon_type: extract_data_field(xml, "LogonType"),
        status: extract_data_field(xml, "Status"),
        workstation: extract_data_field(xml, "WorkstationName"),
        source_port: extract_data_field(xml, "IpPort"),
    };

    Some(ParsedEvent { raw_utc, event })
}

/// Extract an attribute value from a tag, e.g. SystemTime from
/// `<TimeCreated SystemTime='...'/>`. Handles both quote styles.
fn extract_attr(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let tag_start = format!("<{}", tag);
    let pos = xml.find(&tag_start)?;
    let end = xml[pos..].find('>')?;
    let tag_content = &xml[pos..pos + end];

    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", attr, quote);
        if let Some(attr_pos) = tag_content.find(&pattern) {
            let value_start = attr_pos + pattern.len();
            if let Some(value_end) = tag_content[value_start..].find(quote) {
                return Some(tag_content[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

/// Extract the text of `<Data Name='NAME'>value</Data>`. Self-closing
/// or empty Data elements yield None.
fn extract_data_field(xml: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("Name={}{}{}", quote, name, quote);
        if let Some(pos) = xml.find(&pattern) {
            let rest = &xml[pos + pattern.len()..];
            let tag_end = rest.find('>')?;
            if rest[..tag_end].ends_with('/') {
                return None;
            }
            let body = &rest[tag_end + 1..];
            let close = body.find("</Data>")?;
            let value = body[..close].trim();
            if value.is_empty() || value == "-" {
                return None;
            }
            return Some(value.to_string());
        }
    }
    None
}
