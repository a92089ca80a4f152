// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Volume unlock state.
//!
//! Key unwrapping lives elsewhere. Readers only need to know whether file
//! data may be decoded yet.

use crate::error::{ApfsError, Result};

/// Access to a volume's lock state.
pub trait VolumeUnlock {
    /// Whether data on the volume is still inaccessible.
    fn is_locked(&self) -> bool;

    /// Attempt to unlock with a password. Returns whether the volume is now unlocked.
    fn unlock(&mut self, password: &str) -> Result<bool>;

    /// Fail with [ApfsError::VolumeLocked] if the volume is locked.
    fn ensure_unlocked(&self) -> Result<()> {
        if self.is_locked() {
            Err(ApfsError::VolumeLocked)
        } else {
            Ok(())
        }
    }
}

/// A volume without encryption. Always unlocked.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnencryptedVolume;

impl VolumeUnlock for UnencryptedVolume {
    fn is_locked(&self) -> bool {
        false
    }

    fn unlock(&mut self, _password: &str) -> Result<bool> {
        Ok(true)
    }
}

impl<T: VolumeUnlock + ?Sized> VolumeUnlock for &mut T {
    fn is_locked(&self) -> bool {
        (**self).is_locked()
    }

    fn unlock(&mut self, password: &str) -> Result<bool> {
        (**self).unlock(password)
    }
}
