//! Reading and writing of the CQL primitive types used by the frames this
//! driver exchanges during connection setup and keepalive.

use std::collections::HashMap;
use std::num::TryFromIntError;

use bytes::{Buf, BufMut};

use crate::errors::TypeParseError;

fn read_raw_bytes<'a>(count: usize, buf: &mut &'a [u8]) -> Result<&'a [u8], TypeParseError> {
    if buf.len() < count {
        return Err(TypeParseError::TooFewBytes {
            expected: count,
            available: buf.len(),
        });
    }
    let (ret, rest) = buf.split_at(count);
    *buf = rest;
    Ok(ret)
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, TypeParseError> {
    let raw = read_raw_bytes(2, buf)?;
    Ok(u16::from_be_bytes(raw.try_into().unwrap()))
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, TypeParseError> {
    let raw = read_raw_bytes(4, buf)?;
    Ok(i32::from_be_bytes(raw.try_into().unwrap()))
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, TypeParseError> {
    let len = read_short(buf)? as usize;
    let raw = read_raw_bytes(len, buf)?;
    Ok(std::str::from_utf8(raw)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    let len: u16 = v.len().try_into()?;
    write_short(len, buf);
    buf.put_slice(v.as_bytes());
    Ok(())
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    let len: i32 = v.len().try_into()?;
    write_int(len, buf);
    buf.put_slice(v.as_bytes());
    Ok(())
}

/// Writes a `[bytes]` value; `None` is encoded as length -1.
pub fn write_bytes_opt(v: Option<&[u8]>, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    match v {
        Some(bytes) => {
            let len: i32 = bytes.len().try_into()?;
            write_int(len, buf);
            buf.put_slice(bytes);
        }
        None => write_int(-1, buf),
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, TypeParseError> {
    let len = read_short(buf)?;
    let mut result = Vec::with_capacity(len as usize);
    for _ in 0..len {
        result.push(read_string(buf)?.to_owned());
    }
    Ok(result)
}

pub fn write_string_map<K: AsRef<str>, V: AsRef<str>>(
    map: &HashMap<K, V>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    let len: u16 = map.len().try_into()?;
    write_short(len, buf);
    for (key, value) in map {
        write_string(key.as_ref(), buf)?;
        write_string(value.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, TypeParseError> {
    let len = read_short(buf)?;
    let mut result = HashMap::with_capacity(len as usize);
    for _ in 0..len {
        let key = read_string(buf)?.to_owned();
        let values = read_string_list(buf)?;
        result.insert(key, values);
    }
    Ok(result)
}

pub fn write_string_multimap(
    map: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    let len: u16 = map.len().try_into()?;
    write_short(len, buf);
    for (key, values) in map {
        write_string(key, buf)?;
        let values_len: u16 = values.len().try_into()?;
        write_short(values_len, buf);
        for value in values {
            write_string(value, buf)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn test_short_and_int_serialization() {
        setup_tracing();
        for val in [0u16, 1, 257, u16::MAX] {
            let mut buf = Vec::new();
            write_short(val, &mut buf);
            assert_eq!(read_short(&mut &buf[..]).unwrap(), val);
        }
        for val in [i32::MIN, -1, 0, 1, i32::MAX] {
            let mut buf = Vec::new();
            write_int(val, &mut buf);
            assert_eq!(read_int(&mut &buf[..]).unwrap(), val);
        }
    }

    #[test]
    fn test_string_serialization() {
        setup_tracing();
        let mut buf = Vec::new();
        write_string("CQL_VERSION", &mut buf).unwrap();
        assert_eq!(read_string(&mut &buf[..]).unwrap(), "CQL_VERSION");

        // Truncated input must not panic.
        let err = read_string(&mut &buf[..5]).unwrap_err();
        assert!(matches!(
            err,
            crate::errors::TypeParseError::TooFewBytes { .. }
        ));
    }

    #[test]
    fn test_string_multimap_roundtrip() {
        setup_tracing();
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        map.insert("SCYLLA_SHARD".to_owned(), vec!["2".to_owned()]);
        map.insert(
            "COMPRESSION".to_owned(),
            vec!["lz4".to_owned(), "snappy".to_owned()],
        );
        map.insert("EMPTY".to_owned(), Vec::new());

        let mut buf = Vec::new();
        write_string_multimap(&map, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), map);
    }
}
