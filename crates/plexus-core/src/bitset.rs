//! Named flag sets serialised as lists of flag names

/// Declares a copyable flag set backed by a `u32`.
///
/// Each flag carries the label used when the set is written to a metadata
/// document. Sets serialise as a list of labels and deserialise from either a
/// list of labels or the raw integer.
#[macro_export]
macro_rules! capability_set {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                const $flag:ident = $bit:expr, $label:literal;
            )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        $vis struct $name(u32);

        impl $name {
            $(
                $(#[$fmeta])*
                pub const $flag: Self = Self(1 << $bit);
            )+

            const LABELS: &'static [(Self, &'static str)] = &[$((Self::$flag, $label)),+];

            /// The empty set
            pub const fn empty() -> Self {
                Self(0)
            }

            /// Every defined flag
            pub const fn all() -> Self {
                Self(0 $(| (1 << $bit))+)
            }

            /// Raw bit representation
            pub const fn bits(&self) -> u32 {
                self.0
            }

            /// Build a set from raw bits, discarding undefined bits
            pub const fn from_bits_truncate(bits: u32) -> Self {
                Self(bits & Self::all().0)
            }

            /// Whether no flag is set
            pub const fn is_empty(&self) -> bool {
                self.0 == 0
            }

            /// Whether every flag of `other` is set in `self`
            pub const fn contains(&self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// Whether any flag of `other` is set in `self`
            pub const fn intersects(&self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Set the flags of `other`
            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Clear the flags of `other`
            pub fn remove(&mut self, other: Self) {
                self.0 &= !other.0;
            }

            /// Set union
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Labels of the flags that are set, in declaration order
            pub fn names(&self) -> Vec<&'static str> {
                Self::LABELS
                    .iter()
                    .filter(|(flag, _)| self.contains(*flag))
                    .map(|(_, label)| *label)
                    .collect()
            }

            /// Look a single flag up by label (case-insensitive)
            pub fn from_name(name: &str) -> Option<Self> {
                Self::LABELS
                    .iter()
                    .find(|(_, label)| label.eq_ignore_ascii_case(name))
                    .map(|(flag, _)| *flag)
            }
        }

        impl ::std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl ::std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl ::std::ops::BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.names().join(" | "))
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(&self.names().join(","))
            }
        }

        impl $crate::__private::serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error>
            where
                S: $crate::__private::serde::Serializer,
            {
                use $crate::__private::serde::ser::SerializeSeq;
                let names = self.names();
                let mut seq = serializer.serialize_seq(Some(names.len()))?;
                for name in names {
                    seq.serialize_element(name)?;
                }
                seq.end()
            }
        }

        impl<'de> $crate::__private::serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> ::std::result::Result<Self, D::Error>
            where
                D: $crate::__private::serde::Deserializer<'de>,
            {
                struct SetVisitor;

                impl<'de> $crate::__private::serde::de::Visitor<'de> for SetVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                        f.write_str("a list of flag names or an integer bitmask")
                    }

                    fn visit_u64<E>(self, v: u64) -> ::std::result::Result<$name, E>
                    where
                        E: $crate::__private::serde::de::Error,
                    {
                        let bits = u32::try_from(v).map_err(E::custom)?;
                        Ok($name::from_bits_truncate(bits))
                    }

                    fn visit_seq<A>(self, mut seq: A) -> ::std::result::Result<$name, A::Error>
                    where
                        A: $crate::__private::serde::de::SeqAccess<'de>,
                    {
                        use $crate::__private::serde::de::Error;
                        let mut set = $name::empty();
                        while let Some(name) = seq.next_element::<String>()? {
                            let flag = $name::from_name(&name).ok_or_else(|| {
                                A::Error::custom(format!("unknown flag '{}'", name))
                            })?;
                            set.insert(flag);
                        }
                        Ok(set)
                    }
                }

                deserializer.deserialize_any(SetVisitor)
            }
        }
    };
}
