// ============================================================================
// src/hub.rs - USB Hub Configuration and Downstream Port Control
// ============================================================================
//!
//! # USBハブ制御
//!
//! ハブクラスリクエストはすべてハブ自身のコントロールパイプを通る。
//! ここではハブディスクリプタ取得、ダウンストリームポートの電源投入、
//! ポートステータス読み出し、ポートリセットを提供する。
//! ルートポートとの違いは転送経路だけで、ステータスワードの
//! レイアウトとリセットの状態機械は共通。

use log::{debug, error, warn};

use crate::descriptor::{descriptor_type, HubDescriptor, SafePackedRead, HUB_DESCRIPTOR_SIZE};
use crate::enumeration::UsbBus;
use crate::error::{UsbBusError, UsbBusResult};
use crate::port::{
    CLR_PORT_RESET_STALL_US, SET_PORT_RESET_STALL_US, WAIT_PORT_STS_CHANGE_LOOP,
    WAIT_PORT_STS_CHANGE_STALL_US,
};
use crate::registry::DeviceHandle;
use crate::status::{PortFeature, PortStatus, PortStatusBits};
use crate::{request, HostController, SetupPacket, TimerOps};

// ============================================================================
// Hub Class Constants
// ============================================================================

/// リクエスト宛先: ハブ本体
const RECIPIENT_DEVICE: u8 = 0;

/// リクエスト宛先: ダウンストリームポート
const RECIPIENT_OTHER: u8 = 3;

/// ハブレベルフィーチャー: ローカル電源変化
const C_HUB_LOCAL_POWER: u16 = 0;

/// ハブレベルフィーチャー: オーバーカレント変化
const C_HUB_OVER_CURRENT: u16 = 1;

/// bPwrOn2PwrGood の単位（2ミリ秒 = 2000マイクロ秒）
const PWR_ON_2_PWR_GOOD_UNIT_US: u32 = 2_000;

// ============================================================================
// Hub Operations
// ============================================================================

impl<C: HostController, T: TimerOps> UsbBus<C, T> {
    /// ハブディスクリプタを取得する
    fn hub_descriptor(&mut self, hub: DeviceHandle) -> UsbBusResult<HubDescriptor> {
        let mut buf = [0u8; HUB_DESCRIPTOR_SIZE];
        let setup = SetupPacket::class_request(
            true,
            RECIPIENT_DEVICE,
            request::GET_DESCRIPTOR,
            (descriptor_type::HUB as u16) << 8,
            0,
            HUB_DESCRIPTOR_SIZE as u16,
        );
        self.control_transfer(hub, &setup, Some(&mut buf))?;
        HubDescriptor::from_bytes(&buf).ok_or(UsbBusError::DeviceError)
    }

    /// ハブのダウンストリームポートのステータスを取得する
    ///
    /// `port` は1始まり（ハブクラス仕様のワイヤ番号）。
    pub(crate) fn hub_port_status(
        &mut self,
        hub: DeviceHandle,
        port: u8,
    ) -> UsbBusResult<PortStatus> {
        let mut buf = [0u8; 4];
        let setup = SetupPacket::class_request(
            true,
            RECIPIENT_OTHER,
            request::GET_STATUS,
            0,
            port as u16,
            4,
        );
        self.control_transfer(hub, &setup, Some(&mut buf))?;

        let status = u16::from_le_bytes([buf[0], buf[1]]);
        let change = u16::from_le_bytes([buf[2], buf[3]]);
        Ok(PortStatus::from_raw(status, change))
    }

    /// ハブポートフィーチャーを設定する
    pub(crate) fn hub_set_port_feature(
        &mut self,
        hub: DeviceHandle,
        port: u8,
        feature: PortFeature,
    ) -> UsbBusResult<()> {
        let setup = SetupPacket::class_request(
            false,
            RECIPIENT_OTHER,
            request::SET_FEATURE,
            feature.as_u16(),
            port as u16,
            0,
        );
        self.control_transfer(hub, &setup, None)?;
        Ok(())
    }

    /// ハブポートフィーチャーをクリアする
    pub(crate) fn hub_clear_port_feature(
        &mut self,
        hub: DeviceHandle,
        port: u8,
        feature: PortFeature,
    ) -> UsbBusResult<()> {
        let setup = SetupPacket::class_request(
            false,
            RECIPIENT_OTHER,
            request::CLEAR_FEATURE,
            feature.as_u16(),
            port as u16,
            0,
        );
        self.control_transfer(hub, &setup, None)?;
        Ok(())
    }

    /// ハブレベルのチェンジラッチをクリアする
    fn hub_clear_hub_feature(&mut self, hub: DeviceHandle, feature: u16) -> UsbBusResult<()> {
        let setup = SetupPacket::class_request(
            false,
            RECIPIENT_DEVICE,
            request::CLEAR_FEATURE,
            feature,
            0,
            0,
        );
        self.control_transfer(hub, &setup, None)?;
        Ok(())
    }

    /// 公開済みハブを構成する
    ///
    /// ハブディスクリプタからポート数を読み、全ダウンストリームポートに
    /// 電源を投入して安定を待つ。ここでの失敗は部分公開状態を残すため
    /// 呼び出し側で致命として扱われる。
    pub(crate) fn configure_hub(&mut self, hub: DeviceHandle) -> UsbBusResult<()> {
        let desc = self.hub_descriptor(hub)?;
        let port_count = desc.b_nbr_ports;

        self.registry
            .with_node_mut(hub, |n| {
                n.is_hub = true;
                n.downstream_ports = port_count;
            })
            .ok_or(UsbBusError::InvalidArgument)?;

        debug!(
            "hub {}: {} downstream ports, power-good {} ms",
            hub.as_usize(),
            port_count,
            desc.b_pwr_on_2_pwr_good as u32 * 2
        );

        // 全ポートに電源投入
        for port in 1..=port_count {
            self.hub_set_port_feature(hub, port, PortFeature::Power)?;
        }

        self.timer
            .delay_us(desc.b_pwr_on_2_pwr_good as u32 * PWR_ON_2_PWR_GOOD_UNIT_US);

        // ハブレベルのラッチは残っていても害はないので失敗は無視する
        let _ = self.hub_clear_hub_feature(hub, C_HUB_LOCAL_POWER);
        let _ = self.hub_clear_hub_feature(hub, C_HUB_OVER_CURRENT);

        Ok(())
    }

    /// ハブのダウンストリームポートをリセットする
    ///
    /// ルートポートと同じ状態機械をハブのコントロールパイプ経由で駆動する。
    /// ハブはリセット期間を自前で終端するので、完了はポーリングで
    /// RESET ビットが下りるのを待って観測する。
    pub(crate) fn reset_hub_port(&mut self, hub: DeviceHandle, port: u8) {
        if let Err(e) = self.hub_set_port_feature(hub, port, PortFeature::Reset) {
            error!("hub {} port {}: set PORT_RESET failed: {}", hub.as_usize(), port, e);
            return;
        }

        self.timer.delay_us(SET_PORT_RESET_STALL_US);
        self.timer.delay_us(CLR_PORT_RESET_STALL_US);

        let mut finished = false;
        for _ in 0..WAIT_PORT_STS_CHANGE_LOOP {
            match self.hub_port_status(hub, port) {
                Ok(st) => {
                    if !st.status.contains(PortStatusBits::RESET) {
                        finished = true;
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        "hub {} port {}: status read during reset failed: {}",
                        hub.as_usize(),
                        port,
                        e
                    );
                    return;
                }
            }
            self.timer.delay_us(WAIT_PORT_STS_CHANGE_STALL_US);
        }

        if !finished {
            warn!("hub {} port {}: reset not finished in time", hub.as_usize(), port);
            return;
        }

        let _ = self.hub_clear_port_feature(hub, port, PortFeature::ResetChange);
        let _ = self.hub_clear_port_feature(hub, port, PortFeature::ConnectChange);

        let _ = self.hub_set_port_feature(hub, port, PortFeature::Enable);
        let _ = self.hub_clear_port_feature(hub, port, PortFeature::EnableChange);
    }
}
