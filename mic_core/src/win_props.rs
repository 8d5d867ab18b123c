//! Small Windows property-store helpers shared by the enumerator and volume
//! modules. Carried forward from the teacher's `utils::win_helpers`.

#![cfg(target_os = "windows")]

use anyhow::{Result, anyhow};
use windows::Win32::System::Com::StructuredStorage::PROPVARIANT;
use windows::Win32::System::Variant::VT_LPWSTR;

/// Read a `VT_LPWSTR` property value as an owned `String`.
pub(crate) fn read_prop_string(prop: &PROPVARIANT) -> Result<String> {
    unsafe {
        let value = &prop.Anonymous.Anonymous;
        if value.vt != VT_LPWSTR {
            return Err(anyhow!("property was not a string (vt = {})", value.vt.0));
        }
        let pwstr = value.Anonymous.pwszVal;
        Ok(pwstr.to_string()?)
    }
}
