// ============================================================================
// src/enumeration.rs - Bus Enumeration Walker
// ============================================================================
//!
//! # バス列挙
//!
//! ルートポートから始まる深さ優先のツリー走査。接続変化を観測した
//! ポートをリセットし、デバイスを構成してレジストリへ公開する。
//! ハブを見つけるとそのダウンストリームポートへ再帰する。
//! アドレスカウンタはツリー全体で共有され、単調増加する。
//!
//! デバイス単位の失敗（ディスクリプタ不良、転送失敗）はそのポートの
//! 見送りにとどまり、走査は続行する。公開後のハブ構成失敗だけは
//! 部分公開状態を残すため走査全体に伝播する。

use log::{debug, warn};

use crate::descriptor::class_code;
use crate::device::{self, DeviceNode};
use crate::error::UsbBusResult;
use crate::port;
use crate::registry::{DeviceHandle, DeviceRegistry};
use crate::status::{PortChangeBits, PortFeature, PortStatus};
use crate::{DeviceCallback, HostController, TimerOps, Translator, UsbSpeed};

/// ツリーの最大深さ（ルート直結 = 0）
///
/// USB仕様上ハブは5段までだが、不良ハブの自己ループで走査が
/// 発散しないよう余裕を持った上限で打ち切る。
const MAX_TIER: u8 = 7;

// ============================================================================
// USB Bus
// ============================================================================

/// USBバス
///
/// 1つのホストコントローラと、その配下で発見されたデバイスの
/// レジストリを束ねる。列挙はこの型のメソッドとして駆動される。
pub struct UsbBus<C: HostController, T: TimerOps> {
    pub(crate) hc: C,
    pub(crate) timer: T,
    pub(crate) registry: DeviceRegistry,
}

impl<C: HostController, T: TimerOps> UsbBus<C, T> {
    /// ホストコントローラとタイマーからバスを構築する
    pub fn new(hc: C, timer: T) -> Self {
        Self {
            hc,
            timer,
            registry: DeviceRegistry::new(),
        }
    }

    /// バス全体を列挙する
    ///
    /// ルートポートを順に調べ、接続変化のあったポートのデバイスを
    /// 構成・公開する。ハブは深さ優先で再帰的に展開される。
    /// `callback` は公開されたデバイス1台ごとに呼ばれる。
    pub fn enumerate(&mut self, callback: Option<&mut DeviceCallback>) -> UsbBusResult<()> {
        let mut noop = |_: DeviceHandle| {};
        let cb: &mut DeviceCallback = match callback {
            Some(c) => c,
            None => &mut noop,
        };

        // ツリー全体で共有するアドレスカウンタ
        let mut address: u8 = 0;

        let port_count = self.hc.port_count();
        debug!("enumerating {} root ports", port_count);

        for port in 0..port_count {
            let st = match self.hc.port_status(port) {
                Ok(st) => st,
                Err(e) => {
                    debug!("root port {}: status read failed: {}", port, e);
                    continue;
                }
            };

            if !st.has_relevant_change() || !st.is_connected() {
                continue;
            }

            let mut node = DeviceNode::new(port, 0, None);

            // 既にリセット済み（リセット完了ラッチ + 接続 + 有効）の
            // ポートは再リセットせず、ラッチだけ下ろす
            let st = if Self::already_reset(&st) {
                let _ = self.hc.clear_port_feature(port, PortFeature::ResetChange);
                st
            } else {
                port::reset_root_port(&mut self.hc, &mut self.timer, port, 0);
                match self.hc.port_status(port) {
                    Ok(st) => st,
                    Err(e) => {
                        debug!("root port {}: status read after reset failed: {}", port, e);
                        continue;
                    }
                }
            };

            node.speed = st.speed();
            node.max_packet_size0 = node.speed.default_max_packet_size();

            if device::configure_device(&mut self.hc, &mut self.timer, &mut node, &mut address)
                .is_err()
            {
                // このポートは見送り、残りのポートを継続
                continue;
            }

            self.publish_and_expand(node, &mut address, cb)?;
        }

        Ok(())
    }

    /// リセット完了ラッチが立ったまま接続・有効なポートか
    fn already_reset(st: &PortStatus) -> bool {
        st.change.contains(PortChangeBits::C_RESET) && st.is_connected() && st.is_enabled()
    }

    /// 構成済みノードを公開し、インターフェース分割とハブ展開を行う
    ///
    /// コンフィグレーションに複数のインターフェースがある場合、
    /// 2本目以降を兄弟ノードとして追加公開する。各ノードがハブ
    /// インターフェースを持てばダウンストリームへ再帰する。
    fn publish_and_expand(
        &mut self,
        node: DeviceNode,
        address: &mut u8,
        cb: &mut DeviceCallback,
    ) -> UsbBusResult<()> {
        let interface_count = node.interfaces.len();

        let handle = self.registry.publish(node);
        cb(handle);
        self.expand_if_hub(handle, address, cb)?;

        for interface_index in 1..interface_count {
            let sibling = self.registry.derive_sibling(handle, interface_index)?;
            cb(sibling);
            self.expand_if_hub(sibling, address, cb)?;
        }

        Ok(())
    }

    /// ノードがハブならば構成してダウンストリームポートを走査する
    ///
    /// 公開後のハブ構成失敗は部分公開状態を残すため `?` で伝播する。
    fn expand_if_hub(
        &mut self,
        handle: DeviceHandle,
        address: &mut u8,
        cb: &mut DeviceCallback,
    ) -> UsbBusResult<()> {
        let class = self
            .registry
            .with_node(handle, |n| n.active_interface_class())
            .flatten();
        if class != Some(class_code::HUB) {
            return Ok(());
        }

        self.configure_hub(handle)?;
        self.enumerate_hub_ports(handle, address, cb)
    }

    /// ハブのダウンストリームポートを列挙する
    fn enumerate_hub_ports(
        &mut self,
        hub: DeviceHandle,
        address: &mut u8,
        cb: &mut DeviceCallback,
    ) -> UsbBusResult<()> {
        let Some((hub_tier, port_count, hub_speed, hub_address, hub_translator)) =
            self.registry.with_node(hub, |n| {
                (n.tier, n.downstream_ports, n.speed, n.address, n.translator)
            })
        else {
            return Ok(());
        };

        let child_tier = hub_tier + 1;
        if child_tier > MAX_TIER {
            warn!("hub {}: tier {} exceeds depth limit", hub.as_usize(), child_tier);
            return Ok(());
        }

        debug!("hub {}: scanning {} ports", hub.as_usize(), port_count);

        for index in 0..port_count {
            // ハブクラス仕様のワイヤポート番号は1始まり
            let port = index + 1;

            let st = match self.hub_port_status(hub, port) {
                Ok(st) => st,
                Err(e) => {
                    debug!("hub {} port {}: status read failed: {}", hub.as_usize(), port, e);
                    continue;
                }
            };

            if !st.has_relevant_change() || !st.is_connected() {
                continue;
            }

            let mut node = DeviceNode::new(index, child_tier, Some(hub));

            let st = if Self::already_reset(&st) {
                let _ = self.hub_clear_port_feature(hub, port, PortFeature::ResetChange);
                st
            } else {
                self.reset_hub_port(hub, port);
                match self.hub_port_status(hub, port) {
                    Ok(st) => st,
                    Err(e) => {
                        debug!(
                            "hub {} port {}: status read after reset failed: {}",
                            hub.as_usize(),
                            port,
                            e
                        );
                        continue;
                    }
                }
            };

            node.speed = st.speed();
            node.max_packet_size0 = node.speed.default_max_packet_size();

            // High Speed 未満のデバイスはトランスレータを要する:
            // 親が High Speed ハブならこのハブが変換点、そうでなければ
            // 既に上流で決まった変換点をそのまま引き継ぐ
            if node.speed != UsbSpeed::High && node.speed != UsbSpeed::Super {
                node.translator = if hub_speed == UsbSpeed::High {
                    Some(Translator {
                        hub_address,
                        port: index,
                    })
                } else {
                    hub_translator
                };
            }

            if device::configure_device(&mut self.hc, &mut self.timer, &mut node, address)
                .is_err()
            {
                continue;
            }

            self.publish_and_expand(node, address, cb)?;
        }

        Ok(())
    }
}
