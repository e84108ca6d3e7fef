use bitflags::bitflags;

use crate::error::GatewayError;

bitflags! {
    /// Entity categories the cache stores
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CacheFlags: u32 {
        const USERS = 1;
        const GUILDS = 1 << 1;
        const MEMBERS = 1 << 2;
        const CHANNELS = 1 << 3;
        const MESSAGES = 1 << 4;
        const ROLES = 1 << 5;
        const VOICE_STATES = 1 << 6;
    }
}

impl CacheFlags {
    /// Parse a comma separated category list such as `users,members`.
    ///
    /// `all` and `none` are accepted as shorthands.
    pub fn parse_list(list: &str) -> Result<Self, GatewayError> {
        let mut flags = Self::empty();

        for name in list.split(',').map(str::trim).filter(|name| !name.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "all" => flags |= Self::all(),
                "none" => {}
                other => {
                    let flag = Self::from_name(&other.to_ascii_uppercase()).ok_or_else(|| {
                        GatewayError::Config(format!("unknown cache category '{name}'"))
                    })?;
                    flags |= flag;
                }
            }
        }

        Ok(flags)
    }
}

impl Default for CacheFlags {
    fn default() -> Self {
        Self::all()
    }
}
