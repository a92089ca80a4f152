// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Common identifier types.

use crate::DiskLayout;
use core::fmt::{Display, Formatter};
use core::ops::Deref;

macro_rules! identifier {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, DiskLayout)]
        pub struct $name(pub u64);

        impl Deref for $name {
            type Target = u64;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
                f.write_fmt(format_args!("{}", self.0))
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

identifier!(
    /// An object identifier (`oid_t`) whose storage class isn't known.
    ObjectIdentifierRaw
);

identifier!(
    /// An object identifier that is guaranteed to be a virtual object.
    ///
    /// Virtual objects are resolved through object maps.
    VirtualObjectIdentifierRaw
);

identifier!(
    /// A physical block address (`paddr_t`).
    ///
    /// 0 is the first block of the container.
    PhysicalAddressRaw
);

identifier!(
    /// A transaction identifier (`xid_t`).
    ///
    /// Transactions are monotonically increasing. 0 is never a valid
    /// transaction identifier.
    TransactionIdentifierRaw
);

impl From<ObjectIdentifierRaw> for VirtualObjectIdentifierRaw {
    fn from(value: ObjectIdentifierRaw) -> Self {
        Self(value.0)
    }
}

impl From<ObjectIdentifierRaw> for PhysicalAddressRaw {
    fn from(value: ObjectIdentifierRaw) -> Self {
        Self(value.0)
    }
}
