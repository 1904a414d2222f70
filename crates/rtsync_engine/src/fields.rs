//! Typed column readers.
//!
//! Every reader turns an unexpected value into
//! [`EngineError::MalformedInput`] naming the table and column, so a bad
//! row fails on its own without touching anything else.

use crate::error::{EngineError, EngineResult};
use crate::prefix::Prefix;
use rtsync_store::{Row, RowId, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};

fn malformed(row: &Row, column: &str, message: impl Into<String>) -> EngineError {
    EngineError::malformed(row.table(), column, message)
}

/// Required text column.
pub fn text<'a>(row: &'a Row, column: &str) -> EngineResult<&'a str> {
    match row.get(column) {
        Value::Text(s) => Ok(s),
        Value::Null => Err(malformed(row, column, "missing")),
        other => Err(malformed(row, column, format!("expected text, got {other:?}"))),
    }
}

/// Optional text column; empty text reads as absent.
pub fn optional_text<'a>(row: &'a Row, column: &str) -> EngineResult<Option<&'a str>> {
    match row.get(column) {
        Value::Null => Ok(None),
        Value::Text(s) if s.is_empty() => Ok(None),
        Value::Text(s) => Ok(Some(s)),
        other => Err(malformed(row, column, format!("expected text, got {other:?}"))),
    }
}

/// Optional integer column that must fit `u32`.
pub fn optional_u32(row: &Row, column: &str) -> EngineResult<Option<u32>> {
    match row.get(column) {
        Value::Null => Ok(None),
        Value::Integer(n) => u32::try_from(*n)
            .map(Some)
            .map_err(|_| malformed(row, column, format!("{n} out of range"))),
        other => Err(malformed(row, column, format!("expected integer, got {other:?}"))),
    }
}

/// Required integer column that must fit `u32`.
pub fn u32_value(row: &Row, column: &str) -> EngineResult<u32> {
    optional_u32(row, column)?.ok_or_else(|| malformed(row, column, "missing"))
}

/// Optional integer column that must fit `u8`.
pub fn optional_u8(row: &Row, column: &str) -> EngineResult<Option<u8>> {
    match optional_u32(row, column)? {
        None => Ok(None),
        Some(n) => u8::try_from(n)
            .map(Some)
            .map_err(|_| malformed(row, column, format!("{n} out of range"))),
    }
}

/// Optional boolean column.
pub fn optional_bool(row: &Row, column: &str) -> EngineResult<Option<bool>> {
    match row.get(column) {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(malformed(row, column, format!("expected boolean, got {other:?}"))),
    }
}

/// Required reference column.
pub fn reference(row: &Row, column: &str) -> EngineResult<RowId> {
    row.reference(column)
        .ok_or_else(|| malformed(row, column, "missing reference"))
}

/// Optional IPv4 address column; empty text reads as absent.
pub fn optional_ipv4(row: &Row, column: &str) -> EngineResult<Option<Ipv4Addr>> {
    optional_text(row, column)?
        .map(|s| {
            s.parse::<Ipv4Addr>()
                .map_err(|_| malformed(row, column, format!("invalid IPv4 address '{s}'")))
        })
        .transpose()
}

/// Required IPv4 address column.
pub fn ipv4(row: &Row, column: &str) -> EngineResult<Ipv4Addr> {
    optional_ipv4(row, column)?.ok_or_else(|| malformed(row, column, "missing"))
}

/// Required IP address column.
pub fn ip(row: &Row, column: &str) -> EngineResult<IpAddr> {
    let s = text(row, column)?;
    s.parse::<IpAddr>()
        .map_err(|_| malformed(row, column, format!("invalid address '{s}'")))
}

/// Required prefix column.
pub fn prefix(row: &Row, column: &str) -> EngineResult<Prefix> {
    let s = text(row, column)?;
    s.parse::<Prefix>()
        .map_err(|e| malformed(row, column, e.to_string()))
}

fn list<'a>(row: &'a Row, column: &str) -> EngineResult<&'a [Value]> {
    row.get(column)
        .as_list()
        .ok_or_else(|| malformed(row, column, "expected list"))
}

/// List of prefixes.
pub fn prefix_set(row: &Row, column: &str) -> EngineResult<BTreeSet<Prefix>> {
    list(row, column)?
        .iter()
        .map(|v| {
            let s = v
                .as_text()
                .ok_or_else(|| malformed(row, column, "expected text member"))?;
            s.parse::<Prefix>()
                .map_err(|e| malformed(row, column, e.to_string()))
        })
        .collect()
}

/// List of IP addresses, in column order.
pub fn ip_list(row: &Row, column: &str) -> EngineResult<Vec<IpAddr>> {
    list(row, column)?
        .iter()
        .map(|v| {
            let s = v
                .as_text()
                .ok_or_else(|| malformed(row, column, "expected text member"))?;
            s.parse::<IpAddr>()
                .map_err(|_| malformed(row, column, format!("invalid address '{s}'")))
        })
        .collect()
}

/// List of text values as a set.
pub fn text_set(row: &Row, column: &str) -> EngineResult<BTreeSet<String>> {
    list(row, column)?
        .iter()
        .map(|v| {
            v.as_text()
                .map(str::to_string)
                .ok_or_else(|| malformed(row, column, "expected text member"))
        })
        .collect()
}

/// Map of area id to area row.
pub fn area_map(row: &Row, column: &str) -> EngineResult<BTreeMap<Ipv4Addr, RowId>> {
    let map = match row.get(column) {
        Value::Null => return Ok(BTreeMap::new()),
        Value::Map(m) => m,
        other => return Err(malformed(row, column, format!("expected map, got {other:?}"))),
    };
    map.iter()
        .map(|(k, v)| {
            let area = k
                .parse::<Ipv4Addr>()
                .map_err(|_| malformed(row, column, format!("invalid area id '{k}'")))?;
            let id = v
                .as_row_ref()
                .ok_or_else(|| malformed(row, column, format!("area {k} is not a reference")))?;
            Ok((area, id))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtsync_store::{SequenceNumber, Table};

    fn row(cols: &[(&str, Value)]) -> Row {
        Row::new(
            RowId::new(),
            Table::Route,
            cols.iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            SequenceNumber::new(1),
        )
    }

    #[test]
    fn integers_are_range_checked() {
        let r = row(&[("a", Value::Integer(-1)), ("b", Value::Integer(300))]);
        assert!(optional_u32(&r, "a").is_err());
        assert_eq!(optional_u32(&r, "b").unwrap(), Some(300));
        assert!(optional_u8(&r, "b").is_err());
        assert_eq!(optional_u32(&r, "c").unwrap(), None);
        assert!(u32_value(&r, "c").is_err());
    }

    #[test]
    fn addresses_and_prefixes() {
        let r = row(&[
            ("rid", Value::text("1.1.1.1")),
            ("empty", Value::text("")),
            ("bad", Value::text("1.1.1")),
            ("pfx", Value::text("10.0.0.0/8")),
            ("host", Value::text("10.0.0.1/8")),
        ]);
        assert_eq!(ipv4(&r, "rid").unwrap(), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(optional_ipv4(&r, "empty").unwrap(), None);
        assert!(ipv4(&r, "bad").is_err());
        assert_eq!(prefix(&r, "pfx").unwrap().to_string(), "10.0.0.0/8");

        let err = prefix(&r, "host").unwrap_err();
        assert!(matches!(err, EngineError::MalformedInput { ref column, .. } if column == "host"));
    }

    #[test]
    fn lists() {
        let r = row(&[
            ("nets", Value::text_list(["10.0.0.0/8", "192.168.0.0/16"])),
            ("hops", Value::text_list(["10.0.0.1", "fe80::1"])),
            ("mixed", Value::List(vec![Value::text("a"), Value::Integer(1)])),
        ]);
        assert_eq!(prefix_set(&r, "nets").unwrap().len(), 2);
        assert_eq!(ip_list(&r, "hops").unwrap().len(), 2);
        assert!(text_set(&r, "mixed").is_err());
        assert!(prefix_set(&r, "absent").unwrap().is_empty());
    }

    #[test]
    fn area_maps() {
        let area = RowId::new();
        let r = row(&[
            ("areas", Value::map([("0.0.0.1", Value::Ref(area))])),
            ("bad", Value::map([("one", Value::Ref(area))])),
        ]);
        let map = area_map(&r, "areas").unwrap();
        assert_eq!(map[&Ipv4Addr::new(0, 0, 0, 1)], area);
        assert!(area_map(&r, "bad").is_err());
        assert!(area_map(&r, "absent").unwrap().is_empty());
    }
}
