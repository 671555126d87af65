//! ATmega328P 绑定
//!
//! 把位引擎接到真实硬件上：Timer0 工作在 CTC 模式提供半位节拍
//! （TIMER0_COMPA 向量），PORTB 的电平变化中断（PCINT0 向量）捕获
//! 起始位下降沿。引擎整体放在进程级单例里——定时器只有一个，中断
//! 向量也只能指向一处，多实例没有意义。
//!
//! 前台 API 是阻塞式的：每次自旋迭代只占一个关中断窗口，窗口之间
//! 中断照常进出，不会饿死节拍。

use core::cell::RefCell;

use avr_device::atmega328p::Peripherals;
use critical_section::Mutex;

use crate::engine::SoftUart;
use crate::timing::{Prescaler, Timing};
use crate::{Config, LinkState, Port, SerialError, RX_BUFFER_SIZE, TX_BUFFER_SIZE};

// ============================================================================
// 单例与中断向量
// ============================================================================

type Uart = SoftUart<PinLine, RX_BUFFER_SIZE, TX_BUFFER_SIZE>;

static UART: Mutex<RefCell<Option<Uart>>> = Mutex::new(RefCell::new(None));

#[avr_device::interrupt(atmega328p)]
fn TIMER0_COMPA() {
    critical_section::with(|cs| {
        if let Some(uart) = UART.borrow_ref_mut(cs).as_mut() {
            uart.on_tick();
        }
    });
}

#[cfg(not(feature = "tx-only"))]
#[avr_device::interrupt(atmega328p)]
fn PCINT0() {
    critical_section::with(|cs| {
        if let Some(uart) = UART.borrow_ref_mut(cs).as_mut() {
            uart.on_rx_edge();
        }
    });
}

// ============================================================================
// 引脚线路
// ============================================================================

/// 直接操作端口寄存器的线路实现
///
/// 寄存器通过 `Peripherals::steal` 访问：所有调用都发生在关中断窗口
/// 或中断上下文里，位操作本身是读改写一条指令的量级。
struct PinLine {
    tx_port: Port,
    tx_mask: u8,
    #[cfg(not(feature = "tx-only"))]
    rx_mask: u8,
}

impl PinLine {
    fn write_tx(&self, high: bool) {
        let dp = unsafe { Peripherals::steal() };
        match self.tx_port {
            Port::B => dp.PORTB.portb.modify(|r, w| unsafe {
                w.bits(if high { r.bits() | self.tx_mask } else { r.bits() & !self.tx_mask })
            }),
            Port::C => dp.PORTC.portc.modify(|r, w| unsafe {
                w.bits(if high { r.bits() | self.tx_mask } else { r.bits() & !self.tx_mask })
            }),
            Port::D => dp.PORTD.portd.modify(|r, w| unsafe {
                w.bits(if high { r.bits() | self.tx_mask } else { r.bits() & !self.tx_mask })
            }),
        }
    }
}

impl crate::SerialLine for PinLine {
    fn set_tx_high(&mut self) {
        self.write_tx(true);
    }

    fn set_tx_low(&mut self) {
        self.write_tx(false);
    }

    #[cfg(not(feature = "tx-only"))]
    fn rx_is_low(&self) -> bool {
        let dp = unsafe { Peripherals::steal() };
        dp.PORTB.pinb.read().bits() & self.rx_mask == 0
    }

    #[cfg(not(feature = "tx-only"))]
    fn enable_edge_capture(&mut self) {
        let dp = unsafe { Peripherals::steal() };
        dp.EXINT
            .pcmsk0
            .modify(|r, w| unsafe { w.bits(r.bits() | self.rx_mask) });
    }

    #[cfg(not(feature = "tx-only"))]
    fn disable_edge_capture(&mut self) {
        let dp = unsafe { Peripherals::steal() };
        dp.EXINT
            .pcmsk0
            .modify(|r, w| unsafe { w.bits(r.bits() & !self.rx_mask) });
    }

    #[cfg(not(feature = "tx-only"))]
    fn timer_count(&self) -> u8 {
        let dp = unsafe { Peripherals::steal() };
        dp.TC0.tcnt0.read().bits()
    }
}

// ============================================================================
// 初始化
// ============================================================================

/// 建立连接，只能调用一次
///
/// 检查失败时不触碰任何硬件状态。可能的失败：
/// - 定时器已在计数（连接已建立或 Timer0 另有他用）
/// - RX 引脚不在 PORTB 上（PCINT0 向量只覆盖 PB0..PB7）
/// - 引脚编号越界、该时钟下推不出合法的 OCR
pub fn initialise(config: Config) -> Result<(), SerialError> {
    let (tx_port, tx_pin) = config.get_tx();
    if tx_pin > 7 {
        return Err(SerialError::InvalidPin);
    }
    #[cfg(not(feature = "tx-only"))]
    let rx_pin = {
        let (rx_port, rx_pin) = config.get_rx();
        if rx_pin > 7 {
            return Err(SerialError::InvalidPin);
        }
        if rx_port != Port::B {
            return Err(SerialError::UnsupportedPort);
        }
        rx_pin
    };
    let timing = Timing::derive(config.get_clock_hz(), config.get_baud())?;

    critical_section::with(|cs| {
        let mut slot = UART.borrow_ref_mut(cs);
        if slot.is_some() {
            return Err(SerialError::AlreadyRunning);
        }

        let dp = unsafe { Peripherals::steal() };
        if dp.TC0.tccr0b.read().cs0().bits() != 0 {
            return Err(SerialError::AlreadyRunning);
        }

        // TX 输出、空闲高；RX 输入、无上拉
        let tx_mask = 1u8 << tx_pin;
        match tx_port {
            Port::B => dp.PORTB.ddrb.modify(|r, w| unsafe { w.bits(r.bits() | tx_mask) }),
            Port::C => dp.PORTC.ddrc.modify(|r, w| unsafe { w.bits(r.bits() | tx_mask) }),
            Port::D => dp.PORTD.ddrd.modify(|r, w| unsafe { w.bits(r.bits() | tx_mask) }),
        }
        #[cfg(not(feature = "tx-only"))]
        let rx_mask = 1u8 << rx_pin;
        #[cfg(not(feature = "tx-only"))]
        {
            dp.PORTB.ddrb.modify(|r, w| unsafe { w.bits(r.bits() & !rx_mask) });
            dp.PORTB.portb.modify(|r, w| unsafe { w.bits(r.bits() & !rx_mask) });
            dp.EXINT.pcicr.modify(|r, w| unsafe { w.bits(r.bits() | 0x01) });
        }

        // Timer0：CTC，比较值与预分频来自推导结果
        dp.TC0.tccr0a.write(|w| w.wgm0().ctc());
        dp.TC0.ocr0a.write(|w| unsafe { w.bits(timing.ocr) });
        dp.TC0.tcnt0.write(|w| unsafe { w.bits(0) });
        dp.TC0.timsk0.write(|w| w.ocie0a().set_bit());
        dp.TC0.tccr0b.write(|w| match timing.prescaler {
            Prescaler::Div1 => w.cs0().direct(),
            Prescaler::Div8 => w.cs0().prescale_8(),
        });

        // new 里会置 TX 空闲电平并打开边沿捕获
        *slot = Some(SoftUart::new(
            PinLine {
                tx_port,
                tx_mask,
                #[cfg(not(feature = "tx-only"))]
                rx_mask,
            },
            timing,
        ));
        Ok(())
    })?;

    // 单例就位后才放开全局中断
    unsafe { avr_device::interrupt::enable() };
    Ok(())
}

// ============================================================================
// 前台 API
// ============================================================================

/// 发送一个字节（入队）
///
/// 返回 Ok 只表示进了发送队列，不代表已经上线。队列满时返回
/// [`SerialError::BufferFull`]，由调用方择机重试。
pub fn put_char(byte: u8) -> Result<(), SerialError> {
    loop {
        let attempt = critical_section::with(|cs| match UART.borrow_ref_mut(cs).as_mut() {
            None => Err(SerialError::NotInitialised),
            Some(uart) => uart.try_put_char(byte),
        });
        // 锁被别的前台路径占着才会 Locked，下个窗口重试
        if attempt != Err(SerialError::Locked) {
            return attempt;
        }
    }
}

/// 依次发送多个字节，遇到第一个失败就停，返回已接收的数量
///
/// 短写是合法结果；整个序列不保证原子。
pub fn send_data(data: &[u8]) -> usize {
    for (sent, byte) in data.iter().enumerate() {
        if put_char(*byte).is_err() {
            return sent;
        }
    }
    data.len()
}

/// 接收队列中待取的字节数
///
/// 上一次 `get_char` 的搬移还没被节拍执行时会短暂自旋，保证返回的
/// 计数是稳定值。
#[cfg(not(feature = "tx-only"))]
pub fn data_pending() -> usize {
    loop {
        let stable = critical_section::with(|cs| {
            UART.borrow_ref(cs).as_ref().map_or(Some(0), |uart| uart.pending())
        });
        if let Some(count) = stable {
            return count;
        }
    }
}

/// 取一个接收到的字节
///
/// 队列为空时阻塞等待，调用方应先用 [`data_pending`] 确认有数据。
#[cfg(not(feature = "tx-only"))]
pub fn get_char() -> u8 {
    loop {
        let taken = critical_section::with(|cs| match UART.borrow_ref_mut(cs).as_mut() {
            // 未初始化时的行为不在契约内，返回 0 且不碰任何状态
            None => Some(0),
            Some(uart) => uart.try_get_char(),
        });
        if let Some(byte) = taken {
            return byte;
        }
    }
}

/// 开始监听起始位
#[cfg(not(feature = "tx-only"))]
pub fn enable_receive() {
    critical_section::with(|cs| {
        if let Some(uart) = UART.borrow_ref_mut(cs).as_mut() {
            uart.enable_receive();
        }
    });
}

/// 停止监听（在途的帧会收完）
#[cfg(not(feature = "tx-only"))]
pub fn disable_receive() {
    critical_section::with(|cs| {
        if let Some(uart) = UART.borrow_ref_mut(cs).as_mut() {
            uart.disable_receive();
        }
    });
}

/// 当前连接状态位集，未初始化时为空
pub fn link_state() -> LinkState {
    critical_section::with(|cs| {
        UART.borrow_ref(cs)
            .as_ref()
            .map_or(LinkState::empty(), |uart| uart.link_state())
    })
}

/// 接收缓冲区是否溢出过
#[cfg(not(feature = "tx-only"))]
pub fn overflow() -> bool {
    link_state().contains(LinkState::OVERFLOW)
}

/// 清除溢出粘滞标志
#[cfg(not(feature = "tx-only"))]
pub fn clear_overflow() {
    critical_section::with(|cs| {
        if let Some(uart) = UART.borrow_ref_mut(cs).as_mut() {
            uart.clear_overflow();
        }
    });
}

// ============================================================================
// embedded-io 适配
// ============================================================================

/// 面向 `embedded_io` 的读写句柄
///
/// 零尺寸句柄，内部走上面的前台 API；可以在多处持有，读写语义与
/// 直接调用 API 一致。
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPort;

impl SerialPort {
    pub const fn new() -> Self {
        SerialPort
    }
}

impl embedded_io::Error for SerialError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            SerialError::NotInitialised => embedded_io::ErrorKind::NotConnected,
            SerialError::BufferFull => embedded_io::ErrorKind::OutOfMemory,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for SerialPort {
    type Error = SerialError;
}

impl embedded_io::Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        let Some(first) = buf.first() else {
            return Ok(0);
        };
        // 至少写出一个字节：队列满就等节拍腾位置
        loop {
            match put_char(*first) {
                Ok(()) => break,
                Err(SerialError::BufferFull) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(1 + send_data(&buf[1..]))
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        loop {
            let busy = critical_section::with(|cs| {
                UART.borrow_ref(cs).as_ref().map_or(false, |uart| uart.tx_busy())
            });
            if !busy {
                return Ok(());
            }
        }
    }
}

impl embedded_io::WriteReady for SerialPort {
    fn write_ready(&mut self) -> Result<bool, Self::Error> {
        critical_section::with(|cs| match UART.borrow_ref(cs).as_ref() {
            None => Err(SerialError::NotInitialised),
            Some(uart) => Ok(uart.tx_pending() < TX_BUFFER_SIZE),
        })
    }
}

#[cfg(not(feature = "tx-only"))]
impl embedded_io::Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let Some(first) = buf.first_mut() else {
            return Ok(0);
        };
        *first = get_char();
        let mut count = 1;
        while count < buf.len() && data_pending() > 0 {
            buf[count] = get_char();
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(not(feature = "tx-only"))]
impl embedded_io::ReadReady for SerialPort {
    fn read_ready(&mut self) -> Result<bool, Self::Error> {
        Ok(data_pending() > 0)
    }
}
