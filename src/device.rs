// ============================================================================
// src/device.rs - USB Device Node and Configuration
// ============================================================================
//!
//! # USBデバイスノードと構成ハンドシェイク
//!
//! 検出された物理デバイス（またはインターフェース群）1つにつき1ノード。
//! リセット直後のポート上のデバイスに対して、ディスクリプタ取得 →
//! アドレス割り当て → 全ディスクリプタ取得 → 文字列取得 →
//! コンフィグレーション選択のハンドシェイクを駆動する。

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, error};

use crate::descriptor::{
    self, descriptor_type, ConfigurationDescriptor, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor, SafePackedRead, CONFIG_DESCRIPTOR_SIZE, ENDPOINT_DESCRIPTOR_SIZE,
    INTERFACE_DESCRIPTOR_SIZE,
};
use crate::error::{UsbBusError, UsbBusResult};
use crate::registry::DeviceHandle;
use crate::{
    DeviceAddress, HostController, SetupPacket, TimerOps, TransferRoute, Translator, UsbSpeed,
    LANG_ID_ENGLISH_US,
};

// ============================================================================
// Constants
// ============================================================================

/// コンフィグレーションデータバッファの上限（バイト）
pub const MAX_CONFIG_DATA: usize = 1024;

/// インターフェースあたりのエンドポイント数上限
pub const MAX_ENDPOINT: usize = 16;

/// 表示名の最大文字数
pub const MAX_NAME_CHARS: usize = 64;

/// デバイスディスクリプタ取得のリトライ回数
/// （リセット直後のデバイスは応答まで時間がかかることがある）
const GET_DESCRIPTOR_RETRY: usize = 3;

/// SET_ADDRESS後のセトリング待ち（マイクロ秒）
const SET_DEVICE_ADDRESS_STALL_US: u32 = 10_000;

/// コンフィグレーションディスクリプタ取得後のセトリング待ち（マイクロ秒）
const GET_CONFIG_DESCRIPTOR_STALL_US: u32 = 1_000;

// ============================================================================
// Parsed Interface
// ============================================================================

/// パースされたインターフェース
#[derive(Debug, Clone)]
pub struct ParsedInterface {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
}

// ============================================================================
// Device Node
// ============================================================================

/// USBデバイスノード
///
/// コンフィグレーションに複数のインターフェースがある場合、
/// インターフェースごとに1ノードへ分割される（`derive_sibling`）。
/// 分割ノードはアドレス/速度/トランスレータを共有し、
/// アクティブインターフェースだけが異なる。
#[derive(Debug, Clone)]
pub struct DeviceNode {
    /// 割り当て済みバスアドレス（構成前は 0）
    pub address: DeviceAddress,
    /// ルートからのホップ数（ルートポート直結は 0）
    pub tier: u8,
    /// 親上のポートインデックス（0始まり）
    pub port: u8,
    /// 親ハブのハンドル（ルート直結は None）
    pub parent: Option<DeviceHandle>,
    /// デバイス速度
    pub speed: UsbSpeed,
    /// コントロールエンドポイント最大パケットサイズ
    pub max_packet_size0: u16,
    /// バルク転送用データトグルビット
    pub data_toggle: u8,
    /// ハブか
    pub is_hub: bool,
    /// ダウンストリームポート数（ハブ以外は 0）
    pub downstream_ports: u8,
    /// トランザクショントランスレータ
    pub translator: Option<Translator>,
    /// デバイスディスクリプタ（構成完了後に有効）
    pub device_descriptor: Option<DeviceDescriptor>,
    /// 生のコンフィグレーションディスクリプタ列
    pub config_data: Vec<u8>,
    /// アクティブなコンフィグレーションディスクリプタ
    pub config: Option<ConfigurationDescriptor>,
    /// パース済みインターフェース列（ディスクリプタ順）
    pub interfaces: Vec<ParsedInterface>,
    /// アクティブインターフェースのインデックス
    pub active_interface: usize,
    /// 表示名（製造者 + 製品、取得できなければ空）
    pub name: String,
}

impl DeviceNode {
    /// 接続変化を観測したポートに対する新規ノード
    pub fn new(port: u8, tier: u8, parent: Option<DeviceHandle>) -> Self {
        Self {
            address: DeviceAddress::UNASSIGNED,
            tier,
            port,
            parent,
            speed: UsbSpeed::Full,
            max_packet_size0: 8,
            data_toggle: 0,
            is_hub: false,
            downstream_ports: 0,
            translator: None,
            device_descriptor: None,
            config_data: Vec::new(),
            config: None,
            interfaces: Vec::new(),
            active_interface: 0,
            name: String::new(),
        }
    }

    /// 現在のノード状態から転送ルートを組み立てる
    pub fn route(&self) -> TransferRoute {
        TransferRoute {
            address: self.address,
            speed: self.speed,
            max_packet_size: self.max_packet_size0,
            translator: self.translator,
        }
    }

    /// アクティブインターフェースのディスクリプタ
    pub fn active_interface_descriptor(&self) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .get(self.active_interface)
            .map(|i| &i.descriptor)
    }

    /// アクティブインターフェースのエンドポイント列
    pub fn active_endpoints(&self) -> &[EndpointDescriptor] {
        self.interfaces
            .get(self.active_interface)
            .map(|i| i.endpoints.as_slice())
            .unwrap_or(&[])
    }

    /// アクティブインターフェースのクラスコード
    pub fn active_interface_class(&self) -> Option<u8> {
        self.active_interface_descriptor()
            .map(|d| d.b_interface_class)
    }

    /// 兄弟ノードを導出する
    ///
    /// アドレス/速度/トランスレータ等の共有フィールドを複製し、
    /// アクティブインターフェースだけを切り替えた独立ノードを返す。
    /// ハブ判定とトグルは新しいノードで仕切り直し。
    pub fn derive_sibling(&self, interface_index: usize) -> UsbBusResult<DeviceNode> {
        if interface_index >= self.interfaces.len() {
            return Err(UsbBusError::InvalidArgument);
        }

        let mut sibling = self.clone();
        sibling.active_interface = interface_index;
        sibling.data_toggle = 0;
        sibling.is_hub = false;
        sibling.downstream_ports = 0;
        Ok(sibling)
    }
}

// ============================================================================
// Max Packet Size Derivation
// ============================================================================

/// デバイスディスクリプタの報告値からコントロール最大パケットサイズを導出
///
/// USB 3.x (bcdUSB >= 0x0300) では報告値9は 2^9 = 512 を意味する。
pub fn derive_max_packet_size(bcd_usb: u16, reported: u8) -> u16 {
    if bcd_usb >= 0x0300 && reported == 9 {
        1 << 9
    } else {
        reported as u16
    }
}

// ============================================================================
// Device Configuration Handshake
// ============================================================================

/// 新規検出デバイスを構成する
///
/// 手順のいずれかが失敗した場合、このデバイスの構成のみを中断する
/// （呼び出し側はポートをスキップして列挙を継続する）。
/// 文字列ディスクリプタの取得失敗だけは非致命で読み飛ばす。
pub(crate) fn configure_device<C: HostController, T: TimerOps>(
    hc: &mut C,
    timer: &mut T,
    node: &mut DeviceNode,
    address_counter: &mut u8,
) -> UsbBusResult<()> {
    // デバイスディスクリプタ先頭8バイトを取得（最大3回）
    let mut desc_buf = [0u8; 18];
    let mut fetched = false;
    let mut last_error = UsbBusError::TransportFailure;

    for retry in 0..GET_DESCRIPTOR_RETRY {
        let setup = SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 8);
        match hc.control_transfer(&node.route(), &setup, Some(&mut desc_buf[..8])) {
            Ok(_) => {
                debug!("port {}: device descriptor fetch ok (try {})", node.port, retry);
                fetched = true;
                break;
            }
            Err(e) => last_error = e,
        }
    }

    if !fetched {
        error!("port {}: device descriptor fetch failed after {} tries", node.port, GET_DESCRIPTOR_RETRY);
        return Err(last_error);
    }

    let bcd_usb = u16::from_le_bytes([desc_buf[2], desc_buf[3]]);
    node.max_packet_size0 = derive_max_packet_size(bcd_usb, desc_buf[7]);

    // アドレスを割り当てる。カウンタはツリー全体で共有され、
    // 以降このデバイスへの転送はすべて新アドレスを使う。
    *address_counter += 1;
    let new_address = DeviceAddress(*address_counter);

    let setup = SetupPacket::set_address(new_address);
    hc.control_transfer(&node.route(), &setup, None).map_err(|e| {
        error!("port {}: SET_ADDRESS {} failed", node.port, new_address.as_u8());
        e
    })?;
    timer.delay_us(SET_DEVICE_ADDRESS_STALL_US);

    node.address = new_address;

    // デバイスディスクリプタ全体を再取得
    let setup = SetupPacket::get_descriptor(descriptor_type::DEVICE, 0, 18);
    hc.control_transfer(&node.route(), &setup, Some(&mut desc_buf))?;

    let device_desc =
        DeviceDescriptor::from_bytes(&desc_buf).ok_or(UsbBusError::DeviceError)?;
    node.device_descriptor = Some(device_desc);

    // 製造者/製品文字列を取得（失敗は読み飛ばす）
    fetch_display_name(hc, node, device_desc.i_manufacturer, device_desc.i_product);

    // コンフィグレーション/インターフェース/エンドポイント構造を取得
    fetch_all_configuration(hc, timer, node)?;

    // 既定（先頭）コンフィグレーションを選択
    let config_value = node
        .config
        .as_ref()
        .map(|c| c.b_configuration_value)
        .unwrap_or(1);
    let setup = SetupPacket::set_configuration(config_value);
    hc.control_transfer(&node.route(), &setup, None)?;

    debug!(
        "port {}: device configured, address={} interfaces={}",
        node.port,
        node.address.as_u8(),
        node.interfaces.len()
    );

    Ok(())
}

/// 製造者/製品文字列を連結した表示名を構築する（ベストエフォート）
fn fetch_display_name<C: HostController>(
    hc: &mut C,
    node: &mut DeviceNode,
    manufacturer_index: u8,
    product_index: u8,
) {
    let mut name = String::new();

    for index in [manufacturer_index, product_index] {
        if index == 0 {
            continue;
        }

        let mut buf = [0u8; 255];
        let setup = SetupPacket::get_string_descriptor(index, LANG_ID_ENGLISH_US, 255);
        if hc.control_transfer(&node.route(), &setup, Some(&mut buf)).is_err() {
            continue;
        }

        if let Some(s) = descriptor::parse_string_descriptor(&buf) {
            if !name.is_empty() {
                name.push(' ');
            }
            name.push_str(&s);
        }
    }

    node.name = name.chars().take(MAX_NAME_CHARS).collect();
}

/// 全コンフィグレーション構造を取得してパースする
///
/// まず4バイトのプレフィクスで合計長を調べ、その長さで一括再取得する。
/// パースはスキャナによる逐次オフセット走査:
/// コンフィグレーション → インターフェース × N → 各エンドポイント × M。
pub(crate) fn fetch_all_configuration<C: HostController, T: TimerOps>(
    hc: &mut C,
    timer: &mut T,
    node: &mut DeviceNode,
) -> UsbBusResult<()> {
    // 4バイトプレフィクスで合計長を取得
    let mut prefix = [0u8; 4];
    let setup = SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, 4);
    hc.control_transfer(&node.route(), &setup, Some(&mut prefix))?;
    timer.delay_us(GET_CONFIG_DESCRIPTOR_STALL_US);

    let total_length = u16::from_le_bytes([prefix[2], prefix[3]]) as usize;
    if total_length < CONFIG_DESCRIPTOR_SIZE || total_length > MAX_CONFIG_DATA {
        error!("port {}: bad configuration total length {}", node.port, total_length);
        return Err(UsbBusError::DeviceError);
    }

    // 合計長で一括取得
    let mut data = vec![0u8; total_length];
    let setup = SetupPacket::get_descriptor(descriptor_type::CONFIGURATION, 0, total_length as u16);
    hc.control_transfer(&node.route(), &setup, Some(&mut data))?;

    // コンフィグレーションディスクリプタ自身を探す
    let skipped = descriptor::next_descriptor(
        &data,
        descriptor_type::CONFIGURATION,
        CONFIG_DESCRIPTOR_SIZE as u8,
    )?;
    let config = ConfigurationDescriptor::from_bytes(&data[skipped..])
        .ok_or(UsbBusError::DeviceError)?;

    let mut cursor = skipped + CONFIG_DESCRIPTOR_SIZE;
    let mut interfaces = Vec::new();

    for _ in 0..config.b_num_interfaces {
        // 次のインターフェースディスクリプタへ
        let skipped = descriptor::next_descriptor(
            &data[cursor..],
            descriptor_type::INTERFACE,
            INTERFACE_DESCRIPTOR_SIZE as u8,
        )?;
        cursor += skipped;

        let iface = InterfaceDescriptor::from_bytes(&data[cursor..])
            .ok_or(UsbBusError::DeviceError)?;
        cursor += INTERFACE_DESCRIPTOR_SIZE;

        let num_endpoints = iface.b_num_endpoints as usize;
        if num_endpoints > MAX_ENDPOINT {
            error!(
                "port {}: interface reports {} endpoints (max {})",
                node.port, num_endpoints, MAX_ENDPOINT
            );
            return Err(UsbBusError::DeviceError);
        }

        let mut endpoints = Vec::with_capacity(num_endpoints);
        for _ in 0..num_endpoints {
            let skipped = descriptor::next_descriptor(
                &data[cursor..],
                descriptor_type::ENDPOINT,
                ENDPOINT_DESCRIPTOR_SIZE as u8,
            )?;
            cursor += skipped;

            let ep = EndpointDescriptor::from_bytes(&data[cursor..])
                .ok_or(UsbBusError::DeviceError)?;
            cursor += ENDPOINT_DESCRIPTOR_SIZE;

            endpoints.push(ep);
        }

        interfaces.push(ParsedInterface {
            descriptor: iface,
            endpoints,
        });
    }

    node.config_data = data;
    node.config = Some(config);
    node.interfaces = interfaces;
    node.active_interface = 0;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_max_packet_size() {
        // USB 2.0 は報告値そのまま
        assert_eq!(derive_max_packet_size(0x0200, 8), 8);
        assert_eq!(derive_max_packet_size(0x0200, 64), 64);

        // USB 3.x の報告値9は 2^9
        assert_eq!(derive_max_packet_size(0x0300, 9), 512);
        assert_eq!(derive_max_packet_size(0x0310, 9), 512);

        // USB 3.x でも9以外は額面どおり
        assert_eq!(derive_max_packet_size(0x0300, 64), 64);

        // USB 2.0 の9は額面どおり
        assert_eq!(derive_max_packet_size(0x0200, 9), 9);
    }

    fn node_with_interfaces(count: usize) -> DeviceNode {
        let mut node = DeviceNode::new(0, 0, None);
        node.address = DeviceAddress(3);
        node.speed = UsbSpeed::High;
        node.translator = None;
        for i in 0..count {
            let mut raw = [0u8; 9];
            raw[0] = 9;
            raw[1] = 4;
            raw[2] = i as u8; // bInterfaceNumber
            raw[5] = 0x08;
            node.interfaces.push(ParsedInterface {
                descriptor: InterfaceDescriptor::from_bytes(&raw).unwrap(),
                endpoints: Vec::new(),
            });
        }
        node
    }

    #[test]
    fn test_derive_sibling_shares_identity() {
        let mut node = node_with_interfaces(3);
        node.data_toggle = 1;
        node.is_hub = true;
        node.downstream_ports = 4;

        let sibling = node.derive_sibling(2).unwrap();
        assert_eq!(sibling.address, node.address);
        assert_eq!(sibling.speed, node.speed);
        assert_eq!(sibling.translator, node.translator);
        assert_eq!(sibling.active_interface, 2);

        // ハブ判定とトグルは引き継がない
        assert!(!sibling.is_hub);
        assert_eq!(sibling.downstream_ports, 0);
        assert_eq!(sibling.data_toggle, 0);

        let desc = sibling.active_interface_descriptor().unwrap();
        assert_eq!(desc.b_interface_number, 2);
    }

    #[test]
    fn test_derive_sibling_out_of_range() {
        let node = node_with_interfaces(2);
        assert_eq!(
            node.derive_sibling(2).unwrap_err(),
            UsbBusError::InvalidArgument
        );
    }

    #[test]
    fn test_new_node_defaults() {
        let node = DeviceNode::new(5, 2, Some(DeviceHandle(7)));
        assert_eq!(node.address, DeviceAddress::UNASSIGNED);
        assert_eq!(node.port, 5);
        assert_eq!(node.tier, 2);
        assert_eq!(node.parent, Some(DeviceHandle(7)));
        assert!(!node.is_hub);
        assert!(node.name.is_empty());
        assert!(node.active_interface_descriptor().is_none());
    }
}
