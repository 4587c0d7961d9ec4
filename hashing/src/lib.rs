// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

mod value;
pub use crate::value::Value;

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;

use byteorder::ByteOrder;
use digest::consts::U20;
use generic_array::GenericArray;
use serde::de::Visitor;
use serde::ser::{Serialize, Serializer};
use serde::{Deserialize, Deserializer};
use sha1::{Digest as Sha1Digest, Sha1};

pub const FINGERPRINT_SIZE: usize = 20;

pub const ZERO_FINGERPRINT: Fingerprint = Fingerprint([0; FINGERPRINT_SIZE]);

///
/// The distinguished sentinel recorded for files which do not exist. It shares the file-digest
/// keyspace with real content digests, but cannot be produced by hashing.
///
pub const NONEXISTENT_FINGERPRINT: Fingerprint =
    Fingerprint(*b"NO_EXIST\0\0\0\0\0\0\0\0\0\0\0\0");

///
/// A 20 byte tag identifying a value, a file's contents, or a position in the memo trie.
///
#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        if bytes.len() != FINGERPRINT_SIZE {
            panic!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            );
        }

        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.clone_from_slice(&bytes[0..FINGERPRINT_SIZE]);
        Fingerprint(fingerprint)
    }

    pub fn from_bytes(bytes: GenericArray<u8, U20>) -> Fingerprint {
        Fingerprint(bytes.into())
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("{e:?}"))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        let mut s = String::new();
        for &byte in &self.0 {
            fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
        }
        s
    }

    ///
    /// Using the fact that a Fingerprint is computed using a strong hash function, computes a
    /// strong but short hash value from a prefix.
    ///
    pub fn prefix_hash(&self) -> u64 {
        byteorder::BigEndian::read_u64(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl<'de> Visitor<'de> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> Result<(), fmt::Error> {
                formatter.write_str("struct Fingerprint")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&format!("{v:?}: {err}")),
                        &format!("A hex representation of a {FINGERPRINT_SIZE} byte value")
                            .as_str(),
                    )
                })
            }
        }

        deserializer.deserialize_string(FingerprintVisitor)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl TryFrom<&str> for Fingerprint {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Fingerprint::from_hex_string(s)
    }
}

///
/// Adds fingerprints as 160 bit unsigned big-endian integers, modulo `2^160`.
///
/// Together with `fingerprint_subtract`, this allows accumulating an order-independent hash of a
/// set of siblings: the sum is insensitive to the order in which members are added or removed.
///
pub fn fingerprint_sum(fingerprints: &[Fingerprint]) -> Fingerprint {
    let mut acc = [0_u8; FINGERPRINT_SIZE];
    for fingerprint in fingerprints {
        let mut carry = 0_u16;
        for i in (0..FINGERPRINT_SIZE).rev() {
            let sum = acc[i] as u16 + fingerprint.0[i] as u16 + carry;
            acc[i] = sum as u8;
            carry = sum >> 8;
        }
    }
    Fingerprint(acc)
}

///
/// Subtracts `b` from `a` as 160 bit unsigned big-endian integers, modulo `2^160`.
///
pub fn fingerprint_subtract(a: &Fingerprint, b: &Fingerprint) -> Fingerprint {
    let mut acc = [0_u8; FINGERPRINT_SIZE];
    let mut borrow = 0_i16;
    for i in (0..FINGERPRINT_SIZE).rev() {
        let diff = a.0[i] as i16 - b.0[i] as i16 - borrow;
        if diff < 0 {
            acc[i] = (diff + 256) as u8;
            borrow = 1;
        } else {
            acc[i] = diff as u8;
            borrow = 0;
        }
    }
    Fingerprint(acc)
}

///
/// Produce the structural fingerprint of the given values.
///
pub fn fingerprint_of(values: &[Value]) -> Fingerprint {
    let mut hasher = ValueHasher::new();
    hasher.feed_all(values);
    hasher.finish()
}

///
/// An incremental structural hasher over `Value`s and raw bytes.
///
/// Every value is fed as a short type sigil followed by the element count, then its children;
/// maps and sets are canonicalised by sorted keys/members, so structurally equal values always
/// produce equal fingerprints regardless of insertion order. A fingerprint may be taken
/// mid-stream with `fingerprint`, after which feeding may continue: the memo database uses this
/// to derive a dependency-name digest and then extend it into a content digest.
///
pub struct ValueHasher {
    hasher: Sha1,
}

impl ValueHasher {
    pub fn new() -> ValueHasher {
        ValueHasher {
            hasher: Sha1::new(),
        }
    }

    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn feed(&mut self, value: &Value) {
        match value {
            Value::None => self.feed_bytes(b"n."),
            Value::Bool(true) => self.feed_bytes(b"t."),
            Value::Bool(false) => self.feed_bytes(b"f."),
            Value::Int(i) => {
                if *i < 0 {
                    self.feed_bytes(format!("i.-{:x}.", i.unsigned_abs()).as_bytes());
                } else {
                    self.feed_bytes(format!("i.{i:x}.").as_bytes());
                }
            }
            Value::Float(f) => {
                self.feed_bytes(b"fo.");
                self.feed_bytes(&f.to_le_bytes());
            }
            Value::Str(s) => {
                self.feed_bytes(format!("sz.{:x}.", s.len()).as_bytes());
                self.feed_bytes(s.as_bytes());
            }
            Value::Seq(elements) => {
                self.feed_bytes(format!("ls.{:x}.", elements.len()).as_bytes());
                for element in elements {
                    self.feed(element);
                }
            }
            Value::Map(entries) => {
                // BTreeMap iteration order is the canonical sorted order: keys first, then
                // values, as two runs.
                self.feed_bytes(format!("d.{:x}.", entries.len()).as_bytes());
                for key in entries.keys() {
                    self.feed_bytes(format!("sz.{:x}.", key.len()).as_bytes());
                    self.feed_bytes(key.as_bytes());
                }
                for value in entries.values() {
                    self.feed(value);
                }
            }
            Value::Set(members) => {
                self.feed_bytes(format!("se.{:x}.", members.len()).as_bytes());
                for member in members {
                    self.feed(member);
                }
            }
        }
    }

    pub fn feed_all(&mut self, values: &[Value]) {
        for value in values {
            self.feed(value);
        }
    }

    ///
    /// Feed the entire contents of the reader, returning the number of bytes consumed.
    ///
    pub fn feed_reader<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<u64> {
        let mut buf = [0_u8; 8192];
        let mut total = 0_u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(total);
            }
            self.hasher.update(&buf[..n]);
            total += n as u64;
        }
    }

    ///
    /// Returns the fingerprint of everything fed so far, without consuming the hasher.
    ///
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::from_bytes(self.hasher.clone().finalize())
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint::from_bytes(self.hasher.finalize())
    }
}
