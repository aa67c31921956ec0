use std::{
    fmt::{self, Display},
    num::ParseIntError,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Identifier minted by [IdAllocator](crate::allocator::IdAllocator). It is an integer internally,
/// but travels as a decimal string because it doubles as the document key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StretchId(u64);

impl StretchId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Key under which the stretch is stored.
    pub fn key(self) -> String {
        self.0.to_string()
    }
}

impl Display for StretchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StretchId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

impl From<u64> for StretchId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for StretchId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StretchId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl de::Visitor<'_> for IdVisitor {
            type Value = StretchId;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal stretch id")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(StretchId(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(StretchId)
                    .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse()
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::StretchId;

    #[test]
    fn decimal_form_is_exact_for_whole_range() {
        for value in [0, 1, 7, u32::MAX as u64 + 1, u64::MAX - 1, u64::MAX] {
            let id = StretchId::new(value);
            assert_eq!(id.key().parse::<StretchId>().unwrap(), id);
        }
        assert_eq!(StretchId::new(u64::MAX).key(), "18446744073709551615");
    }

    #[test]
    fn rejects_non_decimal_keys() {
        assert!("".parse::<StretchId>().is_err());
        assert!("-1".parse::<StretchId>().is_err());
        assert!("18446744073709551616".parse::<StretchId>().is_err());
        assert!(serde_json::from_str::<StretchId>("\"abc\"").is_err());
    }
}
