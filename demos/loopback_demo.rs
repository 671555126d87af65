//! 外接回环演示：TX 直接跳线到 RX，自发自收
//!
//! 通过 `embedded_io` 句柄读写。发送一段报文后把回环收到的内容再发
//! 一遍，用示波器或逻辑分析仪在 PB1 上就能看到两份相同的波形。

#![cfg_attr(target_arch = "avr", no_std)]
#![cfg_attr(target_arch = "avr", no_main)]

#[cfg(target_arch = "avr")]
mod demo {
    use embedded_io::{Read, Write};
    use panic_halt as _;

    use soft_serial::atmega328::{self as serial, SerialPort};
    use soft_serial::{Baud, Config, Port};

    const MESSAGE: &[u8] = b"Hello, loopback!";

    #[avr_device::entry]
    fn main() -> ! {
        let config = Config::new()
            .baud(Baud::B38400)
            .tx_pin(Port::B, 1)
            .rx_pin(Port::B, 2);

        if serial::initialise(config).is_err() {
            loop {}
        }

        let mut port = SerialPort::new();

        let mut received = [0u8; MESSAGE.len()];
        let mut filled = 0;

        port.write_all(MESSAGE).ok();
        port.flush().ok();

        // 回环线上自己发的帧会原样回来
        while filled < received.len() {
            if let Ok(n) = port.read(&mut received[filled..]) {
                filled += n;
            }
        }

        if received == *MESSAGE {
            port.write_all(&received[..]).ok();
            port.flush().ok();
        }

        loop {}
    }
}

#[cfg(not(target_arch = "avr"))]
fn main() {
    // 本示例只面向 AVR 目标
}
