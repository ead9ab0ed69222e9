//! Native plugin ABI
//!
//! A plugin artifact is a shared library exporting two C-linkage symbols:
//!
//! - [`PLUGIN_CREATE_SYMBOL`] returns an owned, heap-allocated
//!   `Box<dyn Plugin>` behind a thin pointer. The host takes ownership.
//! - [`PLUGIN_METADATA_SYMBOL`] returns a NUL-terminated JSON metadata
//!   document with static lifetime.
//!
//! The interface major version is part of both symbol names, so a host built
//! for `v1` never binds to a `v2` artifact. Trait objects cross the boundary,
//! so plugins must be built with the same toolchain and the same
//! `plexus-plugin-api` major version as the host. Use [`declare_plugin!`] to
//! export both symbols.
//!
//! [`declare_plugin!`]: crate::declare_plugin

use crate::plugin::Plugin;
use std::os::raw::c_char;

/// Major version of the plugin interface
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Factory symbol, NUL-terminated
pub const PLUGIN_CREATE_SYMBOL: &[u8] = b"plexus_plugin_create_v1\0";

/// Metadata symbol, NUL-terminated
pub const PLUGIN_METADATA_SYMBOL: &[u8] = b"plexus_plugin_metadata_v1\0";

/// Signature of the factory symbol
#[allow(improper_ctypes_definitions)]
pub type PluginCreateFn = unsafe extern "C" fn() -> *mut Box<dyn Plugin>;

/// Signature of the metadata symbol
pub type PluginMetadataFn = unsafe extern "C" fn() -> *const c_char;

/// Symbol name without the trailing NUL, for diagnostics
pub fn symbol_name(symbol: &[u8]) -> &str {
    let trimmed = symbol.strip_suffix(b"\0").unwrap_or(symbol);
    std::str::from_utf8(trimmed).unwrap_or("<invalid symbol>")
}

/// Export a plugin type from a `cdylib` crate.
///
/// The constructor expression must evaluate to a `fn() -> T` where `T`
/// implements [`Plugin`](crate::Plugin). The exporting crate must not
/// forbid `unsafe_code`, since `#[no_mangle]` counts as unsafe.
///
/// ```rust,ignore
/// plexus_plugin_api::declare_plugin!(HelloPlugin, HelloPlugin::new);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty, $constructor:expr) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn plexus_plugin_create_v1() -> *mut ::std::boxed::Box<dyn $crate::Plugin> {
            let constructor: fn() -> $plugin_type = $constructor;
            let plugin: ::std::boxed::Box<dyn $crate::Plugin> =
                ::std::boxed::Box::new(constructor());
            ::std::boxed::Box::into_raw(::std::boxed::Box::new(plugin))
        }

        #[no_mangle]
        pub extern "C" fn plexus_plugin_metadata_v1() -> *const ::std::os::raw::c_char {
            static METADATA: $crate::__private::Lazy<::std::ffi::CString> =
                $crate::__private::Lazy::new(|| {
                    let constructor: fn() -> $plugin_type = $constructor;
                    let plugin = constructor();
                    let json = $crate::Plugin::metadata(&plugin)
                        .to_json()
                        .unwrap_or_default();
                    ::std::ffi::CString::new(json).unwrap_or_default()
                });
            METADATA.as_ptr()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_carry_abi_version() {
        let suffix = format!("_v{PLUGIN_ABI_VERSION}");
        assert!(symbol_name(PLUGIN_CREATE_SYMBOL).ends_with(&suffix));
        assert!(symbol_name(PLUGIN_METADATA_SYMBOL).ends_with(&suffix));
        assert_eq!(symbol_name(PLUGIN_CREATE_SYMBOL), "plexus_plugin_create_v1");
    }
}
