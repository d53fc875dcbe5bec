use chrono::{DateTime, Utc};
use uuid::Uuid;
use crate::core::error::{Error, Result};

/// Bit-granular deserializer over a byte slice.
///
/// Mirror of [`super::BitWriter`]: bits are read LSB-first. Every `read_*`
/// has a `skip_*` counterpart that consumes exactly the same bits without
/// materializing a result, which is how record sizes are computed without
/// deserializing payloads. Reading past the end of the buffer is a
/// `CorruptRecord` error.
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            byte_pos: 0,
            bit_offset: 0,
        }
    }

    /// Byte position, counting a partially consumed byte as consumed.
    pub fn position(&self) -> usize {
        if self.bit_offset == 0 {
            self.byte_pos
        } else {
            self.byte_pos + 1
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position())
    }

    /// Unread bytes from the next byte-aligned position.
    pub fn tail(&self) -> &'a [u8] {
        &self.data[self.position().min(self.data.len())..]
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Read `count` bits (count <= 64) into the low bits of the result.
    pub fn read_bits(&mut self, mut count: u8) -> Result<u64> {
        debug_assert!(count <= 64);
        let mut value = 0u64;
        let mut got = 0u8;
        while count > 0 {
            let byte = *self
                .data
                .get(self.byte_pos)
                .ok_or_else(|| Error::corrupt("read past end of record"))?;
            let avail = 8 - self.bit_offset;
            let take = avail.min(count);
            let mask = ((1u16 << take) - 1) as u8;
            let bits = (byte >> self.bit_offset) & mask;
            value |= (bits as u64) << got;
            got += take;
            count -= take;
            self.bit_offset += take;
            if self.bit_offset == 8 {
                self.bit_offset = 0;
                self.byte_pos += 1;
            }
        }
        Ok(value)
    }

    /// Discard the rest of a partially consumed byte.
    pub fn align_to_byte(&mut self) {
        if self.bit_offset != 0 {
            self.bit_offset = 0;
            self.byte_pos += 1;
        }
    }

    pub fn skip_bits(&mut self, count: u64) -> Result<()> {
        let total = (self.byte_pos as u64 * 8 + self.bit_offset as u64)
            .checked_add(count)
            .ok_or_else(|| Error::corrupt("skip length overflow"))?;
        if total > self.data.len() as u64 * 8 {
            return Err(Error::corrupt("skip past end of record"));
        }
        self.byte_pos = (total / 8) as usize;
        self.bit_offset = (total % 8) as u8;
        Ok(())
    }

    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>> {
        if len > self.remaining() {
            return Err(Error::corrupt("read past end of record"));
        }
        if self.bit_offset == 0 {
            let end = self.byte_pos + len;
            let out = self.data[self.byte_pos..end].to_vec();
            self.byte_pos = end;
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(self.read_bits(8)? as u8);
            }
            Ok(out)
        }
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_bit()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_bits(8)? as u8 as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(self.read_bits(16)? as u16)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_bits(16)? as u16 as i16)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.read_bits(32)? as u32)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_bits(32)? as u32 as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_bits(64)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_bits(64)? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_bits(32)? as u32))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_bits(64)?))
    }

    pub fn read_char(&mut self) -> Result<char> {
        let code = self.read_bits(32)? as u32;
        char::from_u32(code).ok_or_else(|| Error::corrupt(format!("invalid char code {}", code)))
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_bits(8)? as u8;
            value |= ((byte & 127) as u64) << shift;
            if byte & 128 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(Error::corrupt("variable-length integer overflow"));
            }
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_var_u64()? as usize;
        let bytes = self.read_raw(len)?;
        String::from_utf8(bytes).map_err(|_| Error::corrupt("invalid UTF-8 in string"))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_var_u64()? as usize;
        self.read_raw(len)
    }

    pub fn read_guid(&mut self) -> Result<Uuid> {
        let bytes = self.read_raw(16)?;
        let arr: [u8; 16] = bytes.as_slice().try_into().expect("16-byte read");
        Ok(Uuid::from_bytes(arr))
    }

    pub fn read_datetime(&mut self) -> Result<DateTime<Utc>> {
        let millis = self.read_i64()?;
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| Error::corrupt(format!("timestamp {} out of range", millis)))
    }

    // Skip counterparts. Each consumes exactly the bits the matching read
    // would have consumed.

    pub fn skip_bool(&mut self) -> Result<()> {
        self.skip_bits(1)
    }

    pub fn skip_var_u64(&mut self) -> Result<()> {
        self.read_var_u64().map(|_| ())
    }

    pub fn skip_string(&mut self) -> Result<()> {
        let len = self.read_var_u64()?;
        let bits = len
            .checked_mul(8)
            .ok_or_else(|| Error::corrupt("string length overflow"))?;
        self.skip_bits(bits)
    }

    pub fn skip_bytes(&mut self) -> Result<()> {
        let len = self.read_var_u64()?;
        let bits = len
            .checked_mul(8)
            .ok_or_else(|| Error::corrupt("byte array length overflow"))?;
        self.skip_bits(bits)
    }

    pub fn skip_guid(&mut self) -> Result<()> {
        self.skip_bits(128)
    }

    pub fn skip_datetime(&mut self) -> Result<()> {
        self.skip_bits(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BitWriter;
    use chrono::TimeZone;

    #[test]
    fn bit_level_roundtrip() {
        let mut w = BitWriter::new();
        w.write_bit(true);
        w.write_bits(0b101101, 6);
        w.write_bit(false);
        w.write_u8(0xAB);
        w.write_u32(0xDEADBEEF);
        let buf = w.finish();

        let mut r = BitReader::new(&buf);
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_bits(6).unwrap(), 0b101101);
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.read_u8().unwrap(), 0xAB);
        assert_eq!(r.read_u32().unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn primitive_roundtrip() {
        let guid = Uuid::new_v4();
        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 0).unwrap();

        let mut w = BitWriter::new();
        w.write_i16(-1234);
        w.write_u64(u64::MAX);
        w.write_f64(3.25);
        w.write_string("hello world");
        w.write_guid(&guid);
        w.write_datetime(&ts);
        w.write_bytes(&[1, 2, 3]);
        let buf = w.finish();

        let mut r = BitReader::new(&buf);
        assert_eq!(r.read_i16().unwrap(), -1234);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_f64().unwrap(), 3.25);
        assert_eq!(r.read_string().unwrap(), "hello world");
        assert_eq!(r.read_guid().unwrap(), guid);
        assert_eq!(r.read_datetime().unwrap(), ts);
        assert_eq!(r.read_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn unaligned_string_roundtrip() {
        // A leading bit pushes everything off byte alignment.
        let mut w = BitWriter::new();
        w.write_bit(true);
        w.write_string("unaligned");
        let buf = w.finish();

        let mut r = BitReader::new(&buf);
        assert!(r.read_bit().unwrap());
        assert_eq!(r.read_string().unwrap(), "unaligned");
    }

    #[test]
    fn skip_consumes_same_bits_as_read() {
        let mut w = BitWriter::new();
        w.write_bit(true);
        w.write_string("some value");
        w.write_guid(&Uuid::new_v4());
        w.write_bytes(&[9; 40]);
        w.write_datetime(&Utc::now());
        let buf = w.finish();

        let mut reading = BitReader::new(&buf);
        reading.read_bit().unwrap();
        reading.read_string().unwrap();
        reading.read_guid().unwrap();
        reading.read_bytes().unwrap();
        reading.read_datetime().unwrap();

        let mut skipping = BitReader::new(&buf);
        skipping.skip_bool().unwrap();
        skipping.skip_string().unwrap();
        skipping.skip_guid().unwrap();
        skipping.skip_bytes().unwrap();
        skipping.skip_datetime().unwrap();

        assert_eq!(reading.position(), skipping.position());
    }

    #[test]
    fn read_past_end_is_corrupt() {
        let mut r = BitReader::new(&[0x01]);
        assert_eq!(r.read_u8().unwrap(), 1);
        let err = r.read_u8().unwrap_err();
        assert_eq!(err.kind, crate::core::error::ErrorKind::CorruptRecord);
    }

    #[test]
    fn var_u64_boundaries() {
        for value in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut w = BitWriter::new();
            w.write_var_u64(value);
            let buf = w.finish();
            let mut r = BitReader::new(&buf);
            assert_eq!(r.read_var_u64().unwrap(), value);
        }
    }
}
