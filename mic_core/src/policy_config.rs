//! C2's raw OS surface: the undocumented `IPolicyConfig` interface used to
//! change the default capture endpoint. Microsoft has never published this
//! vtable; the layout below is the one every shipping app that needs
//! `SetDefaultEndpoint` has reverse-engineered and relied on for over a
//! decade. The ten reserved slots before `SetDefaultEndpoint` must stay
//! exactly as declared or the vtable call lands on the wrong method.

#![cfg(target_os = "windows")]

use windows::core::{GUID, HRESULT, PCWSTR};

/// CLSID_PolicyConfigClient
pub const POLICY_CONFIG_CLIENT: GUID = GUID::from_u128(0x870af99c_171d_4f9e_af0d_e63df40c2bc9);

#[windows::core::interface("F8679F50-850A-41CF-9C72-430F290290C8")]
pub unsafe trait IPolicyConfig: windows::core::IUnknown {
    fn dummy1(&self) -> HRESULT;
    fn dummy2(&self) -> HRESULT;
    fn dummy3(&self) -> HRESULT;
    fn dummy4(&self) -> HRESULT;
    fn dummy5(&self) -> HRESULT;
    fn dummy6(&self) -> HRESULT;
    fn dummy7(&self) -> HRESULT;
    fn dummy8(&self) -> HRESULT;
    fn dummy9(&self) -> HRESULT;
    fn dummy10(&self) -> HRESULT;
    fn SetDefaultEndpoint(&self, device_id: PCWSTR, role: windows::Win32::Media::Audio::ERole) -> HRESULT;
}
