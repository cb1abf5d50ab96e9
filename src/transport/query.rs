use std::collections::HashMap;

use urlencoding::decode;

use crate::error::TopicError;

/// Parse a URL-encoded property bag (`key=value&…`) from a topic segment.
///
/// Keys without a `=` map to `None`. An empty bag yields an empty map.
pub(crate) fn parse(bag: &str) -> Result<HashMap<String, Option<String>>, TopicError> {
    let mut properties = HashMap::new();

    for pair in bag.split('&').filter(|p| !p.is_empty()) {
        match pair.find('=') {
            None => {
                let key = decode_part(pair)?;
                properties.insert(key, None);
            }
            Some(separator) => {
                let key = decode_part(&pair[..separator])?;
                let value = decode_part(&pair[separator + 1..])?;
                properties.insert(key, Some(value));
            }
        }
    }

    Ok(properties)
}

fn decode_part(part: &str) -> Result<String, TopicError> {
    decode(part)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| TopicError::MalformedPropertyBag(format!("cannot URL-decode {part:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_id() {
        let properties = parse("$rid=0").unwrap();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties["$rid"].as_deref(), Some("0"));
    }

    #[test]
    fn parses_multiple_pairs() {
        let properties = parse("$rid=1&foo=bar").unwrap();
        assert_eq!(properties.len(), 2);
        assert_eq!(properties["$rid"].as_deref(), Some("1"));
        assert_eq!(properties["foo"].as_deref(), Some("bar"));
    }

    #[test]
    fn empty_bag_yields_empty_map() {
        assert!(parse("").unwrap().is_empty());
    }

    #[test]
    fn leading_ampersand_is_tolerated() {
        let properties = parse("&color=red").unwrap();
        assert_eq!(properties.len(), 1);
        assert_eq!(properties["color"].as_deref(), Some("red"));
    }

    #[test]
    fn bare_key_has_no_value() {
        let properties = parse("flag").unwrap();
        assert_eq!(properties["flag"], None);
    }

    #[test]
    fn decodes_percent_escapes() {
        let properties = parse("%24.mid=abc%20def&a%3Db=c%26d").unwrap();
        assert_eq!(properties["$.mid"].as_deref(), Some("abc def"));
        assert_eq!(properties["a=b"].as_deref(), Some("c&d"));
    }

    #[test]
    fn non_utf8_escape_is_rejected() {
        assert!(parse("%FF=1").is_err());
    }
}
