// ============================================================================
// src/registry.rs - Device Registry and Published Device Surface
// ============================================================================
//!
//! # デバイスレジストリ
//!
//! 構成済みデバイスノードの公開先。ノードは安定したハンドルで索引される
//! アリーナに保持され、外部システムが明示的に解放するまで生存する。
//! 公開済みデバイスへの転送操作（コントロール/バルク/ポートリセット）は
//! ハンドル経由で `UsbBus` が提供する。

use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

use crate::descriptor::{EndpointDescriptor, InterfaceDescriptor};
use crate::device::DeviceNode;
use crate::enumeration::UsbBus;
use crate::error::{UsbBusError, UsbBusResult};
use crate::{port, HostController, SetupPacket, TimerOps};

// ============================================================================
// Device Handle
// ============================================================================

/// 公開済みデバイスのハンドル (型安全)
///
/// レジストリ内で安定しており、解放後は無効になる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(pub usize);

impl DeviceHandle {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

// ============================================================================
// Device Registry
// ============================================================================

/// デバイスレジストリ
///
/// 解放済みスロットは None のまま残し、ハンドルの再利用はしない。
pub struct DeviceRegistry {
    nodes: Mutex<Vec<Option<DeviceNode>>>,
}

impl DeviceRegistry {
    /// 空のレジストリを作成
    pub const fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// ノードを公開し、ハンドルを返す
    pub fn publish(&self, node: DeviceNode) -> DeviceHandle {
        let mut nodes = self.nodes.lock();
        let handle = DeviceHandle(nodes.len());
        nodes.push(Some(node));
        handle
    }

    /// 公開済みノードを解放する
    ///
    /// 無効（解放済み/範囲外）なハンドルは `InvalidArgument`。
    pub fn release(&self, handle: DeviceHandle) -> UsbBusResult<()> {
        let mut nodes = self.nodes.lock();
        match nodes.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(UsbBusError::InvalidArgument),
        }
    }

    /// デバイスの表示名を取得（名前が無い/ハンドル無効なら None）
    pub fn display_name(&self, handle: DeviceHandle) -> Option<String> {
        let nodes = self.nodes.lock();
        let node = nodes.get(handle.0)?.as_ref()?;
        if node.name.is_empty() {
            None
        } else {
            Some(node.name.clone())
        }
    }

    /// ノードを参照してクロージャを適用する
    pub fn with_node<R>(&self, handle: DeviceHandle, f: impl FnOnce(&DeviceNode) -> R) -> Option<R> {
        let nodes = self.nodes.lock();
        nodes.get(handle.0)?.as_ref().map(f)
    }

    /// ノードを可変参照してクロージャを適用する
    pub fn with_node_mut<R>(
        &self,
        handle: DeviceHandle,
        f: impl FnOnce(&mut DeviceNode) -> R,
    ) -> Option<R> {
        let mut nodes = self.nodes.lock();
        nodes.get_mut(handle.0)?.as_mut().map(f)
    }

    /// 兄弟ノードを導出して公開する
    ///
    /// 元ノードの共有フィールドを複製し、アクティブインターフェースを
    /// `interface_index` に切り替えた独立ノードが新たなハンドルを得る。
    pub fn derive_sibling(
        &self,
        handle: DeviceHandle,
        interface_index: usize,
    ) -> UsbBusResult<DeviceHandle> {
        let sibling = self
            .with_node(handle, |n| n.derive_sibling(interface_index))
            .ok_or(UsbBusError::InvalidArgument)??;
        Ok(self.publish(sibling))
    }

    /// 公開中のノード数
    pub fn published_count(&self) -> usize {
        self.nodes.lock().iter().filter(|n| n.is_some()).count()
    }

    /// 公開中の全ハンドル（ハンドル順）
    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.nodes
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|_| DeviceHandle(i)))
            .collect()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Published Device Transport Surface
// ============================================================================

impl<C: HostController, T: TimerOps> UsbBus<C, T> {
    /// 公開済みデバイスへのコントロール転送
    pub fn control_transfer(
        &mut self,
        handle: DeviceHandle,
        setup: &SetupPacket,
        data: Option<&mut [u8]>,
    ) -> UsbBusResult<usize> {
        let route = self
            .registry
            .with_node(handle, |n| n.route())
            .ok_or(UsbBusError::InvalidArgument)?;
        self.hc.control_transfer(&route, setup, data)
    }

    /// 公開済みデバイスへのバルク転送
    ///
    /// データトグルはノード側で追跡され、転送後の値が保存される。
    pub fn bulk_transfer(
        &mut self,
        handle: DeviceHandle,
        endpoint: u8,
        data: &mut [u8],
    ) -> UsbBusResult<usize> {
        let (route, mut toggle) = self
            .registry
            .with_node(handle, |n| (n.route(), n.data_toggle))
            .ok_or(UsbBusError::InvalidArgument)?;

        let result = self.hc.bulk_transfer(&route, endpoint, &mut toggle, data);

        let _ = self.registry.with_node_mut(handle, |n| n.data_toggle = toggle);
        result
    }

    /// インターフェースディスクリプタを取得
    pub fn interface_descriptor(
        &self,
        handle: DeviceHandle,
        index: usize,
    ) -> Option<InterfaceDescriptor> {
        self.registry
            .with_node(handle, |n| n.interfaces.get(index).map(|i| i.descriptor))
            .flatten()
    }

    /// エンドポイントディスクリプタを取得
    pub fn endpoint_descriptor(
        &self,
        handle: DeviceHandle,
        interface_index: usize,
        endpoint_index: usize,
    ) -> Option<EndpointDescriptor> {
        self.registry
            .with_node(handle, |n| {
                n.interfaces
                    .get(interface_index)
                    .and_then(|i| i.endpoints.get(endpoint_index))
                    .copied()
            })
            .flatten()
    }

    /// デバイスの上流ポートをリセットする
    ///
    /// ハブ配下のデバイスは親ハブのポートを、ルート直結のデバイスは
    /// ルートポートをリセットする。
    pub fn port_reset(&mut self, handle: DeviceHandle) -> UsbBusResult<()> {
        let (parent, port) = self
            .registry
            .with_node(handle, |n| (n.parent, n.port))
            .ok_or(UsbBusError::InvalidArgument)?;

        match parent {
            Some(hub) => self.reset_hub_port(hub, port + 1),
            None => port::reset_root_port(&mut self.hc, &mut self.timer, port, 0),
        }
        Ok(())
    }

    /// 公開済みデバイスを解放する
    pub fn release(&mut self, handle: DeviceHandle) -> UsbBusResult<()> {
        self.registry.release(handle)
    }

    /// デバイスの表示名を取得
    pub fn display_name(&self, handle: DeviceHandle) -> Option<String> {
        self.registry.display_name(handle)
    }

    /// レジストリへの参照
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{PortFeature, PortStatus};
    use crate::{DeviceAddress, TransferRoute};

    fn sample_node(address: u8, name: &str) -> DeviceNode {
        let mut node = DeviceNode::new(0, 0, None);
        node.address = DeviceAddress(address);
        node.name = String::from(name);
        node
    }

    /// バルク転送ごとにトグルを反転するモック
    struct ToggleHc {
        fail: bool,
    }

    impl HostController for ToggleHc {
        fn port_count(&mut self) -> u8 {
            0
        }

        fn port_status(&mut self, _port: u8) -> UsbBusResult<PortStatus> {
            Err(UsbBusError::InvalidArgument)
        }

        fn set_port_feature(&mut self, _port: u8, _feature: PortFeature) -> UsbBusResult<()> {
            Ok(())
        }

        fn clear_port_feature(&mut self, _port: u8, _feature: PortFeature) -> UsbBusResult<()> {
            Ok(())
        }

        fn control_transfer(
            &mut self,
            _route: &TransferRoute,
            _setup: &SetupPacket,
            _data: Option<&mut [u8]>,
        ) -> UsbBusResult<usize> {
            Err(UsbBusError::TransportFailure)
        }

        fn bulk_transfer(
            &mut self,
            _route: &TransferRoute,
            _endpoint: u8,
            toggle: &mut u8,
            data: &mut [u8],
        ) -> UsbBusResult<usize> {
            if self.fail {
                // 失敗時はトグルに触れない
                return Err(UsbBusError::TransportFailure);
            }
            *toggle ^= 1;
            Ok(data.len())
        }
    }

    struct NullTimer;

    impl TimerOps for NullTimer {
        fn delay_us(&mut self, _us: u32) {}
    }

    #[test]
    fn test_publish_and_release() {
        let registry = DeviceRegistry::new();
        let h1 = registry.publish(sample_node(1, "a"));
        let h2 = registry.publish(sample_node(2, "b"));
        assert_ne!(h1, h2);
        assert_eq!(registry.published_count(), 2);

        assert_eq!(registry.release(h1), Ok(()));
        assert_eq!(registry.published_count(), 1);

        // 二重解放は無効ハンドル
        assert_eq!(registry.release(h1), Err(UsbBusError::InvalidArgument));

        // 範囲外ハンドルも無効
        assert_eq!(
            registry.release(DeviceHandle(99)),
            Err(UsbBusError::InvalidArgument)
        );
    }

    #[test]
    fn test_handles_remain_stable_after_release() {
        let registry = DeviceRegistry::new();
        let h1 = registry.publish(sample_node(1, "a"));
        let h2 = registry.publish(sample_node(2, "b"));

        registry.release(h1).unwrap();

        // 解放後も h2 は同じノードを指す
        let addr = registry.with_node(h2, |n| n.address).unwrap();
        assert_eq!(addr, DeviceAddress(2));

        // 公開中のハンドル一覧にも h2 だけが残る
        assert_eq!(registry.handles(), alloc::vec![h2]);
    }

    #[test]
    fn test_bulk_transfer_persists_data_toggle() {
        let mut bus = UsbBus::new(ToggleHc { fail: false }, NullTimer);
        let handle = bus.registry().publish(sample_node(1, ""));

        let mut buf = [0u8; 8];
        assert_eq!(bus.bulk_transfer(handle, 0x81, &mut buf), Ok(8));

        // 転送後のトグルがノードに保存される
        let toggle = bus.registry().with_node(handle, |n| n.data_toggle).unwrap();
        assert_eq!(toggle, 1);

        assert_eq!(bus.bulk_transfer(handle, 0x81, &mut buf), Ok(8));
        let toggle = bus.registry().with_node(handle, |n| n.data_toggle).unwrap();
        assert_eq!(toggle, 0);
    }

    #[test]
    fn test_bulk_transfer_failure_keeps_toggle() {
        let mut bus = UsbBus::new(ToggleHc { fail: true }, NullTimer);
        let handle = bus.registry().publish(sample_node(1, ""));
        bus.registry()
            .with_node_mut(handle, |n| n.data_toggle = 1)
            .unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(
            bus.bulk_transfer(handle, 0x81, &mut buf),
            Err(UsbBusError::TransportFailure)
        );

        let toggle = bus.registry().with_node(handle, |n| n.data_toggle).unwrap();
        assert_eq!(toggle, 1);

        // 無効なハンドルは転送前に拒否される
        assert_eq!(
            bus.bulk_transfer(DeviceHandle(9), 0x81, &mut buf),
            Err(UsbBusError::InvalidArgument)
        );
    }

    #[test]
    fn test_display_name() {
        let registry = DeviceRegistry::new();
        let named = registry.publish(sample_node(1, "Acme Keyboard"));
        let unnamed = registry.publish(sample_node(2, ""));

        assert_eq!(registry.display_name(named).unwrap(), "Acme Keyboard");
        assert_eq!(registry.display_name(unnamed), None);
        assert_eq!(registry.display_name(DeviceHandle(42)), None);
    }

    #[test]
    fn test_derive_sibling_invalid_handle() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.derive_sibling(DeviceHandle(0), 1),
            Err(UsbBusError::InvalidArgument)
        );
    }
}
