//! BLE GATT intake for the short-range credential exchange. Only started while
//! the device is unconfigured; a saved record restarts the device, which takes
//! the radio back.

use std::sync::{mpsc::SyncSender, Arc, Mutex, MutexGuard};

use esp_idf_hal::modem::BluetoothModem;
use esp_idf_svc::{
    bt::{
        ble::{
            gap::{AdvConfiguration, BleGapEvent, EspBleGap},
            gatt::{
                server::{ConnectionId, EspGatts, GattsEvent, TransferId},
                AutoResponse, GattCharacteristic, GattId, GattInterface, GattResponse,
                GattServiceId, GattStatus, Handle, Permission, Property,
            },
        },
        Ble, BtDriver, BtStatus, BtUuid,
    },
    nvs::EspDefaultNvsPartition,
    sys::{EspError, ESP_FAIL},
};
use log::{debug, info, warn};
use millo_common::{CredentialWriteBuffer, InboundEvent};

use super::enqueue;

const APP_ID: u16 = 0;
// Shared with the companion app.
const SERVICE_UUID: u128 = 0x4fafc201_1fb5_459e_8fcc_c5c9c331914b;
const CREDENTIALS_CHAR_UUID: u128 = 0xbeb5483e_36e1_4688_b7f5_ea07361b26a8;
const SERVICE_HANDLES: u16 = 4;

type Driver = BtDriver<'static, Ble>;
type Gap = EspBleGap<'static, Ble, Arc<Driver>>;
type Gatts = EspGatts<'static, Ble, Arc<Driver>>;

#[derive(Default)]
struct IntakeState {
    gatt_if: Option<GattInterface>,
    credentials_handle: Option<Handle>,
    write: CredentialWriteBuffer,
}

pub struct BleIntake {
    gap: Gap,
    gatts: Gatts,
    device_name: String,
    inbox: SyncSender<InboundEvent>,
    state: Mutex<IntakeState>,
}

impl BleIntake {
    pub fn start(
        modem: BluetoothModem,
        nvs: EspDefaultNvsPartition,
        device_name: &str,
        inbox: SyncSender<InboundEvent>,
    ) -> anyhow::Result<Arc<Self>> {
        let driver = Arc::new(BtDriver::new(modem, Some(nvs))?);
        let intake = Arc::new(Self {
            gap: EspBleGap::new(driver.clone())?,
            gatts: EspGatts::new(driver)?,
            device_name: device_name.to_string(),
            inbox,
            state: Mutex::new(IntakeState::default()),
        });

        let gap_intake = intake.clone();
        intake.gap.subscribe(move |event| {
            if let Err(err) = gap_intake.on_gap_event(event) {
                warn!("BLE GAP event failed: {err}");
            }
        })?;
        let gatts_intake = intake.clone();
        intake.gatts.subscribe(move |(gatt_if, event)| {
            if let Err(err) = gatts_intake.on_gatts_event(gatt_if, event) {
                warn!("BLE GATT event failed: {err}");
            }
        })?;
        intake.gatts.register_app(APP_ID)?;

        info!("BLE credential service registering as `{device_name}`");
        Ok(intake)
    }

    fn state(&self) -> MutexGuard<'_, IntakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_gap_event(&self, event: BleGapEvent) -> Result<(), EspError> {
        match event {
            BleGapEvent::AdvertisingConfigured(status) => {
                check_bt_status("advertising configuration", status);
                self.gap.start_advertising()?;
                info!("BLE advertising started");
            }
            other => debug!("BLE GAP event {other:?}"),
        }
        Ok(())
    }

    fn on_gatts_event(&self, gatt_if: GattInterface, event: GattsEvent) -> Result<(), EspError> {
        match event {
            GattsEvent::ServiceRegistered { status, app_id } => {
                check_gatt_status("app registration", status);
                if app_id == APP_ID {
                    self.create_service(gatt_if)?;
                }
            }
            GattsEvent::ServiceCreated {
                status,
                service_handle,
                ..
            } => {
                check_gatt_status("service creation", status);
                self.gatts.start_service(service_handle)?;
                self.gatts.add_characteristic(
                    service_handle,
                    &GattCharacteristic {
                        uuid: BtUuid::uuid128(CREDENTIALS_CHAR_UUID),
                        permissions: Permission::Write.into(),
                        properties: Property::Write.into(),
                        max_len: CredentialWriteBuffer::MAX_BYTES,
                        auto_rsp: AutoResponse::ByApp,
                    },
                    &[],
                )?;
            }
            GattsEvent::CharacteristicAdded {
                status,
                attr_handle,
                char_uuid,
                ..
            } => {
                check_gatt_status("characteristic", status);
                if char_uuid == BtUuid::uuid128(CREDENTIALS_CHAR_UUID) {
                    self.state().credentials_handle = Some(attr_handle);
                }
            }
            GattsEvent::PeerConnected { addr, .. } => {
                info!("BLE client {addr} connected");
            }
            GattsEvent::PeerDisconnected { addr, .. } => {
                info!("BLE client {addr} disconnected, advertising again");
                self.state().write.cancel();
                self.gap.start_advertising()?;
            }
            GattsEvent::Write {
                conn_id,
                trans_id,
                handle,
                offset,
                need_rsp,
                is_prep,
                value,
                ..
            } => {
                self.on_write(gatt_if, conn_id, trans_id, handle, offset, need_rsp, is_prep, value)?;
            }
            GattsEvent::ExecWrite {
                conn_id,
                trans_id,
                canceled,
                ..
            } => {
                let event = {
                    let mut state = self.state();
                    if canceled {
                        state.write.cancel();
                        None
                    } else {
                        state.write.finish()
                    }
                };
                self.deliver(event);
                self.gatts
                    .send_response(gatt_if, conn_id, trans_id, GattStatus::Ok, None)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn create_service(&self, gatt_if: GattInterface) -> Result<(), EspError> {
        self.state().gatt_if = Some(gatt_if);
        self.gap.set_device_name(&self.device_name)?;
        self.gap.set_adv_conf(&AdvConfiguration {
            include_name: true,
            include_txpower: true,
            flag: 2,
            service_uuid: Some(BtUuid::uuid128(SERVICE_UUID)),
            ..Default::default()
        })?;
        self.gatts.create_service(
            gatt_if,
            &GattServiceId {
                id: GattId {
                    uuid: BtUuid::uuid128(SERVICE_UUID),
                    inst_id: 0,
                },
                is_primary: true,
            },
            SERVICE_HANDLES,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn on_write(
        &self,
        gatt_if: GattInterface,
        conn_id: ConnectionId,
        trans_id: TransferId,
        handle: Handle,
        offset: u16,
        need_rsp: bool,
        is_prep: bool,
        value: &[u8],
    ) -> Result<(), EspError> {
        let (accepted, event) = {
            let mut state = self.state();
            if state.credentials_handle != Some(handle) {
                return Ok(());
            }
            if is_prep {
                (state.write.append(usize::from(offset), value), None)
            } else {
                state.write.cancel();
                let accepted = state.write.append(0, value);
                (accepted, state.write.finish())
            }
        };
        self.deliver(event);

        if !need_rsp {
            return Ok(());
        }
        let status = if accepted {
            GattStatus::Ok
        } else {
            GattStatus::InvalidAttrLen
        };
        if is_prep && accepted {
            // Prepared writes echo the chunk back to the client.
            let mut response = GattResponse::new();
            response
                .attr_handle(handle)
                .auth_req(0)
                .offset(offset)
                .value(value)
                .map_err(|_| EspError::from_infallible::<ESP_FAIL>())?;
            self.gatts
                .send_response(gatt_if, conn_id, trans_id, status, Some(&response))
        } else {
            self.gatts
                .send_response(gatt_if, conn_id, trans_id, status, None)
        }
    }

    fn deliver(&self, event: Option<InboundEvent>) {
        if let Some(event) = event {
            info!("credential record received over BLE");
            enqueue(&self.inbox, event);
        }
    }
}

fn check_bt_status(what: &str, status: BtStatus) {
    if !matches!(status, BtStatus::Success) {
        warn!("BLE {what} failed: {status:?}");
    }
}

fn check_gatt_status(what: &str, status: GattStatus) {
    if !matches!(status, GattStatus::Ok) {
        warn!("BLE {what} failed: {status:?}");
    }
}
