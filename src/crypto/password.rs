//! Password handling for archive encryption.

use zeroize::Zeroizing;

use crate::Result;

/// A password for archive encryption/decryption.
///
/// The backing storage is zeroized on drop and never appears in debug
/// output.
#[derive(Clone)]
pub struct Password {
    inner: Zeroizing<String>,
}

impl Password {
    /// Creates a new password from a string.
    pub fn new<S: Into<String>>(password: S) -> Self {
        Self {
            inner: Zeroizing::new(password.into()),
        }
    }

    /// Returns the password bytes used for key derivation.
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Returns true if the password is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Password").field("len", &self.inner.len()).finish()
    }
}

impl From<&str> for Password {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Password {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Why a password is being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordUse {
    /// The password will encrypt new entry data.
    Encrypt,
    /// The password will decrypt existing entry data.
    Decrypt,
}

/// Supplies passwords to the engine.
///
/// The prompting UI lives outside the core; jobs hand the engine an
/// implementation of this trait. A fixed password is the common case and is
/// covered by the blanket impl on [`Password`].
pub trait PasswordSource: Send + Sync {
    /// Returns the password for the given prompt and use.
    fn get_password(&self, prompt: &str, usage: PasswordUse) -> Result<Password>;
}

impl PasswordSource for Password {
    fn get_password(&self, _prompt: &str, _usage: PasswordUse) -> Result<Password> {
        Ok(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_password() {
        let password = Password::new("secret");
        let debug = format!("{:?}", password);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("len"));
    }

    #[test]
    fn from_conversions() {
        let a: Password = "pw".into();
        let b: Password = String::from("pw").into();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert!(!a.is_empty());
        assert!(Password::new("").is_empty());
    }

    #[test]
    fn fixed_password_source() {
        let src = Password::new("hunter2");
        let got = src.get_password("archive 'x'", PasswordUse::Decrypt).unwrap();
        assert_eq!(got.as_bytes(), b"hunter2");
    }
}
