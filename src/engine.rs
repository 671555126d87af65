//! 中断驱动的位引擎
//!
//! 一个定时器同时伺候两个方向：比较匹配中断以约 2 倍波特率触发，每次
//! 触发是一个"半位节拍"。RX 用起始位下降沿重新对相，使采样点落在每个
//! 数据位的中间；TX 用自己独立的自由相位，每两个节拍推出一位。节拍
//! ISR 的处理顺序固定：先 RX 采样，再 TX 发位，最后替前台搬移接收队列
//! （bottom half）。
//!
//! 前台操作都是单步非阻塞的：每个调用在一个关中断窗口内做 O(1) 的
//! 事情就返回，自旋重试由外层（芯片绑定或测试）负责，这样中断永远
//! 不会被前台长时间挡住。

use crate::buffer::RingBuffer;
use crate::timing::Timing;
use crate::{LinkState, SerialError, SerialLine};

/// 下降沿落在半位周期前半段时的采样倒数：下一个节拍还差整整一个
/// 半位，数三拍正好落到数据位 0 的中点
const SAMPLE_SEED_EARLY: u8 = 3;
/// 下降沿落在后半段时下一个节拍紧随其后，要多数一拍
const SAMPLE_SEED_LATE: u8 = 4;

/// 软件 UART 位引擎
///
/// `L` 是硬件线路抽象，`RX_CAP`/`TX_CAP` 是两个方向的缓冲区容量。
pub struct SoftUart<L: SerialLine, const RX_CAP: usize, const TX_CAP: usize> {
    line: L,
    timing: Timing,
    state: LinkState,
    stretch_count: u8,

    tx_buffer: RingBuffer<TX_CAP>,
    tx_phase: bool,
    tx_bit_count: u8,
    tx_byte: u8,

    #[cfg(not(feature = "tx-only"))]
    rx_buffer: RingBuffer<RX_CAP>,
    #[cfg(not(feature = "tx-only"))]
    rx_phase: bool,
    #[cfg(not(feature = "tx-only"))]
    rx_bit_count: u8,
    #[cfg(not(feature = "tx-only"))]
    rx_byte: u8,
    #[cfg(not(feature = "tx-only"))]
    sample_countdown: u8,
    #[cfg(not(feature = "tx-only"))]
    rx_enabled: bool,
}

impl<L: SerialLine, const RX_CAP: usize, const TX_CAP: usize> SoftUart<L, RX_CAP, TX_CAP> {
    /// 建立连接：TX 置空闲电平，接收默认打开
    pub fn new(mut line: L, timing: Timing) -> Self {
        line.set_tx_high();
        #[cfg(not(feature = "tx-only"))]
        line.enable_edge_capture();

        Self {
            line,
            timing,
            state: LinkState::RUNNING,
            stretch_count: 0,

            tx_buffer: RingBuffer::new(),
            tx_phase: false,
            tx_bit_count: 0,
            tx_byte: 0,

            #[cfg(not(feature = "tx-only"))]
            rx_buffer: RingBuffer::new(),
            #[cfg(not(feature = "tx-only"))]
            rx_phase: false,
            #[cfg(not(feature = "tx-only"))]
            rx_bit_count: 0,
            #[cfg(not(feature = "tx-only"))]
            rx_byte: 0,
            #[cfg(not(feature = "tx-only"))]
            sample_countdown: 0,
            #[cfg(not(feature = "tx-only"))]
            rx_enabled: true,
        }
    }

    // ========================================================================
    // 中断入口
    // ========================================================================

    /// RX 引脚电平变化中断的处理体
    ///
    /// 先抢拍定时器计数（减小测量抖动），确认确实是下降沿，然后关掉
    /// 边沿捕获——本帧已经认领，后续数据位的跳变不该再进来。
    #[cfg(not(feature = "tx-only"))]
    pub fn on_rx_edge(&mut self) {
        let count = self.line.timer_count();

        if !self.rx_enabled || !self.state.rx_idle() {
            return;
        }
        if !self.line.rx_is_low() {
            // 上升沿或毛刺，不是起始位
            return;
        }

        self.line.disable_edge_capture();
        // 半位可能由多个子周期组成（stretch），边沿相位要把组内已经
        // 数过的圈折算进去，单看一圈的计数会差出整圈
        let phase =
            self.stretch_count as u16 * (self.timing.ocr as u16 + 1) + count as u16;
        self.sample_countdown = if phase < self.timing.threshold {
            SAMPLE_SEED_EARLY
        } else {
            SAMPLE_SEED_LATE
        };
        self.state.insert(LinkState::RECEIVED_START);
    }

    /// 比较匹配中断的处理体：一个半位节拍
    pub fn on_tick(&mut self) {
        // 低波特率高时钟时一个半位要数多圈
        self.stretch_count += 1;
        if self.stretch_count < self.timing.stretch {
            return;
        }
        self.stretch_count = 0;

        #[cfg(not(feature = "tx-only"))]
        self.rx_half();
        self.tx_half();
        #[cfg(not(feature = "tx-only"))]
        self.rx_bottom_half();
    }

    /// RX 半：按子状态采样数据位、检查停止位、提交字节
    #[cfg(not(feature = "tx-only"))]
    fn rx_half(&mut self) {
        if self.state.contains(LinkState::RECEIVED_START) {
            self.sample_countdown -= 1;
            if self.sample_countdown == 0 {
                // 数据位 0 的中点
                self.rx_byte = if self.line.rx_is_low() { 0 } else { 1 };
                self.rx_bit_count = 1;
                self.rx_phase = false;
                self.state.remove(LinkState::RECEIVED_START);
                self.state.insert(LinkState::RECEIVING);
            }
        } else if self.state.contains(LinkState::RECEIVING) {
            if !self.rx_phase {
                // 相隔一拍，等到位中点
                self.rx_phase = true;
                return;
            }
            self.rx_phase = false;

            if self.rx_bit_count < 8 {
                if !self.line.rx_is_low() {
                    self.rx_byte |= 1 << self.rx_bit_count;
                }
                self.rx_bit_count += 1;
            } else {
                // 第 9 个采样点是停止位
                if !self.line.rx_is_low() {
                    if self.rx_buffer.append(self.rx_byte).is_err() {
                        self.state.insert(LinkState::OVERFLOW);
                    }
                }
                // 停止位为低是帧错误，整字节静默丢弃

                self.rx_bit_count = 0;
                self.rx_byte = 0;
                self.state.remove(LinkState::RECEIVING);
                if self.rx_enabled {
                    self.line.enable_edge_capture();
                }
            }
        }
    }

    /// TX 半：只在自由相位的奇数拍推进，每两拍一个位
    fn tx_half(&mut self) {
        self.tx_phase = !self.tx_phase;
        if !self.tx_phase {
            return;
        }

        if self.state.contains(LinkState::SENT_START) {
            self.emit_bit(self.tx_byte & 0x01 != 0);
            self.tx_bit_count = 1;
            self.state.remove(LinkState::SENT_START);
            self.state.insert(LinkState::SENDING);
        } else if self.state.contains(LinkState::SENDING) {
            if self.tx_bit_count < 8 {
                self.emit_bit(self.tx_byte >> self.tx_bit_count & 0x01 != 0);
                self.tx_bit_count += 1;
            } else {
                // 停止位，然后把发完的字节移出队列
                self.line.set_tx_high();
                self.state.remove(LinkState::SENDING);
                if self.tx_buffer.shift_down().is_err() {
                    // 前台正持有锁，下个位时隙再试
                    self.state.insert(LinkState::TX_LOCKED);
                }
            }
        } else if self.state.contains(LinkState::TX_LOCKED) {
            if self.tx_buffer.shift_down().is_ok() {
                self.state.remove(LinkState::TX_LOCKED);
            }
        } else if !self.tx_buffer.is_empty() {
            // 起始位，并锁存队头字节
            self.line.set_tx_low();
            self.tx_byte = self.tx_buffer.peek_head();
            self.tx_bit_count = 0;
            self.state.insert(LinkState::SENT_START);
        }
    }

    fn emit_bit(&mut self, bit: bool) {
        if bit {
            self.line.set_tx_high();
        } else {
            self.line.set_tx_low();
        }
    }

    /// RX bottom half：前台消费过队头就在这里真正把它移走
    #[cfg(not(feature = "tx-only"))]
    fn rx_bottom_half(&mut self) {
        if self.rx_buffer.dirty() && self.rx_buffer.shift_down().is_ok() {
            self.rx_buffer.clear_dirty();
        }
    }

    // ========================================================================
    // 前台单步操作（调用方负责关中断窗口与自旋重试）
    // ========================================================================

    /// 取锁、入队、放锁，一步完成
    ///
    /// 锁被占时返回 [`SerialError::Locked`]，由调用方在下个窗口重试；
    /// 队列满时返回 [`SerialError::BufferFull`]。
    pub fn try_put_char(&mut self, byte: u8) -> Result<(), SerialError> {
        if !self.tx_buffer.try_lock() {
            return Err(SerialError::Locked);
        }
        let result = self.tx_buffer.append(byte);
        self.tx_buffer.unlock();
        result
    }

    /// 接收队列长度；搬移请求尚未被节拍处理（计数不稳定）时返回 `None`
    #[cfg(not(feature = "tx-only"))]
    pub fn pending(&self) -> Option<usize> {
        if self.rx_buffer.is_empty() {
            return Some(0);
        }
        if self.rx_buffer.dirty() {
            None
        } else {
            Some(self.rx_buffer.len())
        }
    }

    /// 读队头并标记 dirty，搬移留给下一个节拍的 bottom half
    ///
    /// 队列空或上一次的搬移还没完成时返回 `None`。
    #[cfg(not(feature = "tx-only"))]
    pub fn try_get_char(&mut self) -> Option<u8> {
        if self.rx_buffer.is_empty() || self.rx_buffer.dirty() {
            return None;
        }
        let byte = self.rx_buffer.peek_head();
        self.rx_buffer.set_dirty();
        Some(byte)
    }

    /// 开始监听起始位
    #[cfg(not(feature = "tx-only"))]
    pub fn enable_receive(&mut self) {
        self.rx_enabled = true;
        // 帧接收中时不抢开关，帧尾会按本标志恢复
        if self.state.rx_idle() {
            self.line.enable_edge_capture();
        }
    }

    /// 停止监听。已在接收中的帧会收完，但不再开始新帧
    #[cfg(not(feature = "tx-only"))]
    pub fn disable_receive(&mut self) {
        self.rx_enabled = false;
        self.line.disable_edge_capture();
    }

    // ========================================================================
    // 状态查询
    // ========================================================================

    pub fn link_state(&self) -> LinkState {
        self.state
    }

    /// 接收缓冲区是否溢出过（粘滞标志）
    #[cfg(not(feature = "tx-only"))]
    pub fn overflow(&self) -> bool {
        self.state.contains(LinkState::OVERFLOW)
    }

    #[cfg(not(feature = "tx-only"))]
    pub fn clear_overflow(&mut self) {
        self.state.remove(LinkState::OVERFLOW);
    }

    /// 发送队列中还未上线的字节数（含正在发送的队头）
    pub fn tx_pending(&self) -> usize {
        self.tx_buffer.len()
    }

    /// 发送方向是否还有工作（帧在途或队列非空）
    pub fn tx_busy(&self) -> bool {
        !self.state.tx_idle() || !self.tx_buffer.is_empty()
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }
}
