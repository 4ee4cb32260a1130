//! Production engine backing for the reference host.
//!
//! Safe trait surface over the `Fwpm*` management API. Invariants the unsafe
//! blocks rely on: every buffer handed to the engine outlives the call that
//! borrows it, enumeration handles are destroyed before the session closes,
//! and the engine handle is closed exactly once in `Drop`.
#![allow(unsafe_code)]

use std::ffi::c_void;
use std::ptr;

use uuid::Uuid;
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::{
    FwpmEngineClose0, FwpmEngineOpen0, FwpmFilterAdd0, FwpmFilterCreateEnumHandle0,
    FwpmFilterDeleteById0, FwpmFilterDeleteByKey0, FwpmFilterDestroyEnumHandle0, FwpmFilterEnum0,
    FwpmFilterGetByKey0, FwpmFreeMemory0, FwpmGetAppIdFromFileName0, FwpmProviderAdd0,
    FwpmProviderDeleteByKey0, FwpmProviderGetByKey0, FwpmSubLayerAdd0, FwpmSubLayerDeleteByKey0,
    FwpmSubLayerGetByKey0, FwpmTransactionAbort0, FwpmTransactionBegin0, FwpmTransactionCommit0,
    FWPM_ACTION0, FWPM_CONDITION_ALE_APP_ID, FWPM_CONDITION_IP_PROTOCOL,
    FWPM_CONDITION_IP_REMOTE_ADDRESS, FWPM_CONDITION_IP_REMOTE_PORT, FWPM_DISPLAY_DATA0,
    FWPM_FILTER0, FWPM_FILTER_CONDITION0, FWPM_LAYER_ALE_AUTH_CONNECT_V4,
    FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4, FWPM_PROVIDER0, FWPM_SUBLAYER0, FWP_ACTION_BLOCK,
    FWP_ACTION_PERMIT, FWP_BYTE_BLOB, FWP_CONDITION_VALUE0, FWP_CONDITION_VALUE0_0,
    FWP_MATCH_EQUAL, FWP_MATCH_RANGE, FWP_RANGE0, FWP_UINT16, FWP_UINT64, FWP_UINT8,
    FWP_V4_ADDR_AND_MASK, FWP_V4_ADDR_MASK, FWP_VALUE0, FWP_VALUE0_0,
};
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::{
    FWP_BYTE_BLOB_TYPE, FWP_RANGE_TYPE,
};

use flowgate_common::consts::ENUM_BATCH_SIZE;
use flowgate_policy::{IpCondition, Layer, ObservedFilter, PortCondition};

use crate::{
    EngineBackend, EngineSession, FilterSpec, ProviderSpec, SublayerSpec, WfpError, WfpResult,
};

const ERROR_SUCCESS: u32 = 0;
const ERROR_ACCESS_DENIED: u32 = 5;
const RPC_C_AUTHN_DEFAULT: u32 = 0xFFFF_FFFF;

fn check(status: u32) -> WfpResult<()> {
    match status {
        ERROR_SUCCESS => Ok(()),
        ERROR_ACCESS_DENIED => Err(WfpError::AccessDenied),
        other => Err(WfpError::from_status(other)),
    }
}

fn guid(key: Uuid) -> GUID {
    GUID::from_u128(key.as_u128())
}

fn uuid_of(key: &GUID) -> Uuid {
    Uuid::from_u128(key.to_u128())
}

/// NUL-terminated UTF-16 buffer kept alive for the duration of a call.
fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Opens dynamic sessions against the local engine.
#[derive(Debug, Clone, Default)]
pub struct PlatformBackend;

impl EngineBackend for PlatformBackend {
    fn open(&self) -> WfpResult<Box<dyn EngineSession>> {
        let mut handle = HANDLE::default();
        let status = unsafe {
            FwpmEngineOpen0(
                PCWSTR::null(),
                RPC_C_AUTHN_DEFAULT,
                None,
                None,
                &mut handle,
            )
        };
        check(status)?;
        Ok(Box::new(PlatformEngine { handle }))
    }
}

pub struct PlatformEngine {
    handle: HANDLE,
}

// The engine handle is a plain kernel object reference; nothing in it is
// thread-affine.
unsafe impl Send for PlatformEngine {}

impl Drop for PlatformEngine {
    fn drop(&mut self) {
        unsafe {
            FwpmEngineClose0(self.handle);
        }
    }
}

impl PlatformEngine {
    fn layer_guid(layer: Layer) -> GUID {
        match layer {
            Layer::AleAuthConnectV4 => FWPM_LAYER_ALE_AUTH_CONNECT_V4,
            Layer::AleAuthRecvAcceptV4 => FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4,
        }
    }
}

impl EngineSession for PlatformEngine {
    fn provider_exists(&mut self, key: Uuid) -> WfpResult<bool> {
        let key = guid(key);
        let mut provider: *mut FWPM_PROVIDER0 = ptr::null_mut();
        let status = unsafe { FwpmProviderGetByKey0(self.handle, &key, &mut provider) };
        if !provider.is_null() {
            unsafe { FwpmFreeMemory0(&mut provider.cast::<c_void>()) };
        }
        match check(status) {
            Ok(()) => Ok(true),
            Err(err) if err.is_benign_on_delete() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn add_provider(&mut self, spec: &ProviderSpec) -> WfpResult<()> {
        let name = wide(&spec.name);
        let description = wide(&spec.description);
        let provider = FWPM_PROVIDER0 {
            providerKey: guid(spec.key),
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_ptr().cast_mut()),
                description: PWSTR(description.as_ptr().cast_mut()),
            },
            ..Default::default()
        };
        check(unsafe { FwpmProviderAdd0(self.handle, &provider, None) })
    }

    fn delete_provider(&mut self, key: Uuid) -> WfpResult<()> {
        let key = guid(key);
        check(unsafe { FwpmProviderDeleteByKey0(self.handle, &key) })
    }

    fn sublayer_exists(&mut self, key: Uuid) -> WfpResult<bool> {
        let key = guid(key);
        let mut sublayer: *mut FWPM_SUBLAYER0 = ptr::null_mut();
        let status = unsafe { FwpmSubLayerGetByKey0(self.handle, &key, &mut sublayer) };
        if !sublayer.is_null() {
            unsafe { FwpmFreeMemory0(&mut sublayer.cast::<c_void>()) };
        }
        match check(status) {
            Ok(()) => Ok(true),
            Err(err) if err.is_benign_on_delete() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn add_sublayer(&mut self, spec: &SublayerSpec) -> WfpResult<()> {
        let name = wide(&spec.name);
        let description = wide(&spec.description);
        let mut provider_key = guid(spec.provider_key);
        let sublayer = FWPM_SUBLAYER0 {
            subLayerKey: guid(spec.key),
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_ptr().cast_mut()),
                description: PWSTR(description.as_ptr().cast_mut()),
            },
            providerKey: &mut provider_key,
            weight: spec.weight,
            ..Default::default()
        };
        check(unsafe { FwpmSubLayerAdd0(self.handle, &sublayer, None) })
    }

    fn delete_sublayer(&mut self, key: Uuid) -> WfpResult<()> {
        let key = guid(key);
        check(unsafe { FwpmSubLayerDeleteByKey0(self.handle, &key) })
    }

    fn filter_exists(&mut self, key: Uuid) -> WfpResult<bool> {
        let key = guid(key);
        let mut filter: *mut FWPM_FILTER0 = ptr::null_mut();
        let status = unsafe { FwpmFilterGetByKey0(self.handle, &key, &mut filter) };
        if !filter.is_null() {
            unsafe { FwpmFreeMemory0(&mut filter.cast::<c_void>()) };
        }
        match check(status) {
            Ok(()) => Ok(true),
            Err(err) if err.is_benign_on_delete() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn add_filter(&mut self, spec: &FilterSpec<'_>) -> WfpResult<u64> {
        let compiled = spec.filter;
        let name = wide(&compiled.display_name);
        let description = wide(compiled.description.as_deref().unwrap_or_default());

        // Condition payloads must outlive the FwpmFilterAdd0 call.
        let mut addr_and_mask = FWP_V4_ADDR_AND_MASK::default();
        let mut port_range = FWP_RANGE0::default();
        let mut app_blob = FWP_BYTE_BLOB::default();
        let mut conditions: Vec<FWPM_FILTER_CONDITION0> = Vec::with_capacity(4);

        conditions.push(FWPM_FILTER_CONDITION0 {
            fieldKey: FWPM_CONDITION_IP_PROTOCOL,
            matchType: FWP_MATCH_EQUAL,
            conditionValue: FWP_CONDITION_VALUE0 {
                r#type: FWP_UINT8,
                Anonymous: FWP_CONDITION_VALUE0_0 {
                    uint8: compiled.protocol,
                },
            },
        });

        if let Some(ip) = &compiled.remote_ip {
            let (addr, mask) = match ip {
                IpCondition::Exact(addr) => (u32::from(*addr), u32::MAX),
                IpCondition::Cidr(net) => (
                    u32::from(net.network()),
                    u32::from(net.netmask()),
                ),
            };
            addr_and_mask = FWP_V4_ADDR_AND_MASK { addr, mask };
            conditions.push(FWPM_FILTER_CONDITION0 {
                fieldKey: FWPM_CONDITION_IP_REMOTE_ADDRESS,
                matchType: FWP_MATCH_EQUAL,
                conditionValue: FWP_CONDITION_VALUE0 {
                    r#type: FWP_V4_ADDR_MASK,
                    Anonymous: FWP_CONDITION_VALUE0_0 {
                        v4AddrMask: &mut addr_and_mask,
                    },
                },
            });
        }

        if let Some(port) = &compiled.remote_port {
            match port {
                PortCondition::Single(port) => {
                    conditions.push(FWPM_FILTER_CONDITION0 {
                        fieldKey: FWPM_CONDITION_IP_REMOTE_PORT,
                        matchType: FWP_MATCH_EQUAL,
                        conditionValue: FWP_CONDITION_VALUE0 {
                            r#type: FWP_UINT16,
                            Anonymous: FWP_CONDITION_VALUE0_0 { uint16: *port },
                        },
                    });
                }
                PortCondition::Range(lo, hi) => {
                    port_range = FWP_RANGE0 {
                        valueLow: FWP_VALUE0 {
                            r#type: FWP_UINT16,
                            Anonymous: FWP_VALUE0_0 { uint16: *lo },
                        },
                        valueHigh: FWP_VALUE0 {
                            r#type: FWP_UINT16,
                            Anonymous: FWP_VALUE0_0 { uint16: *hi },
                        },
                    };
                    conditions.push(FWPM_FILTER_CONDITION0 {
                        fieldKey: FWPM_CONDITION_IP_REMOTE_PORT,
                        matchType: FWP_MATCH_RANGE,
                        conditionValue: FWP_CONDITION_VALUE0 {
                            r#type: FWP_RANGE_TYPE,
                            Anonymous: FWP_CONDITION_VALUE0_0 {
                                rangeValue: &mut port_range,
                            },
                        },
                    });
                }
            }
        }

        if let Some(app_id) = &spec.app_id {
            app_blob = FWP_BYTE_BLOB {
                size: app_id.len() as u32,
                data: app_id.as_ptr().cast_mut(),
            };
            conditions.push(FWPM_FILTER_CONDITION0 {
                fieldKey: FWPM_CONDITION_ALE_APP_ID,
                matchType: FWP_MATCH_EQUAL,
                conditionValue: FWP_CONDITION_VALUE0 {
                    r#type: FWP_BYTE_BLOB_TYPE,
                    Anonymous: FWP_CONDITION_VALUE0_0 {
                        byteBlob: &mut app_blob,
                    },
                },
            });
        }

        let mut weight = compiled.weight;
        let mut provider_key = guid(spec.provider_key);
        let action_type = match compiled.action {
            flowgate_policy::Action::Block => FWP_ACTION_BLOCK,
            flowgate_policy::Action::Allow => FWP_ACTION_PERMIT,
        };
        let filter = FWPM_FILTER0 {
            filterKey: guid(compiled.key),
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_ptr().cast_mut()),
                description: PWSTR(description.as_ptr().cast_mut()),
            },
            providerKey: &mut provider_key,
            layerKey: Self::layer_guid(compiled.layer),
            subLayerKey: guid(spec.sublayer_key),
            weight: FWP_VALUE0 {
                r#type: FWP_UINT64,
                Anonymous: FWP_VALUE0_0 { uint64: &mut weight },
            },
            numFilterConditions: conditions.len() as u32,
            filterCondition: conditions.as_mut_ptr(),
            action: FWPM_ACTION0 {
                r#type: action_type,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut id = 0u64;
        check(unsafe { FwpmFilterAdd0(self.handle, &filter, None, Some(&mut id)) })?;
        Ok(id)
    }

    fn delete_filter_by_key(&mut self, key: Uuid) -> WfpResult<()> {
        let key = guid(key);
        check(unsafe { FwpmFilterDeleteByKey0(self.handle, &key) })
    }

    fn delete_filter_by_id(&mut self, id: u64) -> WfpResult<()> {
        check(unsafe { FwpmFilterDeleteById0(self.handle, id) })
    }

    fn enumerate_filters(&mut self, sublayer: Uuid) -> WfpResult<Vec<ObservedFilter>> {
        let sublayer = guid(sublayer);
        let mut enum_handle = HANDLE::default();
        check(unsafe {
            FwpmFilterCreateEnumHandle0(self.handle, None, &mut enum_handle)
        })?;

        // Destroy the enumeration handle on every path out of the loop.
        let result = (|| {
            let mut matching = Vec::new();
            loop {
                let mut entries: *mut *mut FWPM_FILTER0 = ptr::null_mut();
                let mut returned = 0u32;
                check(unsafe {
                    FwpmFilterEnum0(
                        self.handle,
                        enum_handle,
                        ENUM_BATCH_SIZE as u32,
                        &mut entries,
                        &mut returned,
                    )
                })?;
                if returned == 0 {
                    break;
                }
                // The template cannot select by sublayer; filter each batch
                // here and free it before fetching the next.
                unsafe {
                    for i in 0..returned as usize {
                        let filter = &**entries.add(i);
                        if filter.subLayerKey != sublayer {
                            continue;
                        }
                        let name = filter
                            .displayData
                            .name
                            .to_string()
                            .ok()
                            .filter(|s| !s.is_empty());
                        matching.push(ObservedFilter {
                            key: uuid_of(&filter.filterKey),
                            id: filter.filterId,
                            name,
                        });
                    }
                    FwpmFreeMemory0(&mut entries.cast::<c_void>());
                }
                if (returned as usize) < ENUM_BATCH_SIZE {
                    break;
                }
            }
            Ok(matching)
        })();

        unsafe {
            FwpmFilterDestroyEnumHandle0(self.handle, enum_handle);
        }
        result
    }

    fn app_id_from_path(&mut self, path: &str) -> WfpResult<Vec<u8>> {
        let path = wide(path);
        let mut blob: *mut FWP_BYTE_BLOB = ptr::null_mut();
        check(unsafe { FwpmGetAppIdFromFileName0(PCWSTR(path.as_ptr()), &mut blob) })?;
        let bytes = unsafe {
            let blob_ref = &*blob;
            std::slice::from_raw_parts(blob_ref.data, blob_ref.size as usize).to_vec()
        };
        unsafe { FwpmFreeMemory0(&mut blob.cast::<c_void>()) };
        Ok(bytes)
    }

    fn begin_transaction(&mut self) -> WfpResult<()> {
        check(unsafe { FwpmTransactionBegin0(self.handle, 0) })
    }

    fn commit_transaction(&mut self) -> WfpResult<()> {
        check(unsafe { FwpmTransactionCommit0(self.handle) })
    }

    fn abort_transaction(&mut self) -> WfpResult<()> {
        check(unsafe { FwpmTransactionAbort0(self.handle) })
    }
}
