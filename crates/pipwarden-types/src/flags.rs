//! Small bit-set newtype generator used by the policy types.

/// Declares a transparent bit-set newtype with named constants.
///
/// The generated type supports `|`, `&`, `contains`, `intersects` and a
/// `Debug` rendering that lists the set flag names.
macro_rules! bit_set {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(
                $(#[$flag_meta:meta])*
                const $flag:ident = $value:expr;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name($repr);

        impl $name {
            $(
                $(#[$flag_meta])*
                pub const $flag: Self = Self($value);
            )*

            const NAMED: &'static [(&'static str, $repr)] = &[$((stringify!($flag), $value)),*];

            /// Build from raw bits, keeping unknown bits.
            pub const fn from_bits(bits: $repr) -> Self {
                Self(bits)
            }

            /// Raw bit representation.
            pub const fn bits(self) -> $repr {
                self.0
            }

            /// True when no bit is set.
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// True when every bit of `other` is also set in `self`.
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            /// True when `self` and `other` share at least one bit.
            pub const fn intersects(self, other: Self) -> bool {
                self.0 & other.0 != 0
            }

            /// Bitwise union.
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// `self` with the bits of `other` cleared.
            pub const fn difference(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = Self;

            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                if self.0 == 0 {
                    return write!(f, "{}(empty)", stringify!($name));
                }
                let mut names = Vec::new();
                let mut remaining = self.0;
                for (name, bits) in Self::NAMED {
                    // Single-bit flags only; composites would double-print.
                    if bits.count_ones() == 1 && self.0 & bits == *bits {
                        names.push(*name);
                        remaining &= !bits;
                    }
                }
                if remaining != 0 {
                    return write!(f, "{}({} | {:#x})", stringify!($name), names.join(" | "), remaining);
                }
                write!(f, "{}({})", stringify!($name), names.join(" | "))
            }
        }
    };
}
