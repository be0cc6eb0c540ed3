//! Public quote endpoints for A-share listed funds and indices

pub mod eastmoney;
pub mod sina;

pub use eastmoney::EastMoneyClient;
pub use sina::SinaClient;

use std::fmt;

/// Listing venue of a security code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Shanghai,
    Shenzhen,
    Beijing,
    HongKong,
    Us,
}

impl Exchange {
    /// Lower-case prefix used by Sina and most brokers
    pub fn prefix(&self) -> &'static str {
        match self {
            Exchange::Shanghai => "sh",
            Exchange::Shenzhen => "sz",
            Exchange::Beijing => "bj",
            Exchange::HongKong => "hk",
            Exchange::Us => "us",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Split `sh510300` / `sz159915` / `510300` into exchange and bare code.
///
/// Bare six-digit codes are placed by their leading digit: 5 and 6 trade in
/// Shanghai, 0, 1 and 3 in Shenzhen, 4 and 8 in Beijing. Five digits are Hong
/// Kong and alphabetic tickers are US listings. Anything else defaults to
/// Shanghai.
pub fn split_symbol(symbol: &str) -> (Exchange, String) {
    let symbol = symbol.trim();
    let lower = symbol.to_ascii_lowercase();
    for (prefix, exchange) in [
        ("sh", Exchange::Shanghai),
        ("sz", Exchange::Shenzhen),
        ("bj", Exchange::Beijing),
    ] {
        if let Some(code) = lower.strip_prefix(prefix) {
            if !code.is_empty() && code.bytes().all(|b| b.is_ascii_digit()) {
                return (exchange, code.to_string());
            }
        }
    }

    let is_digits = !symbol.is_empty() && symbol.bytes().all(|b| b.is_ascii_digit());
    let exchange = if is_digits && symbol.len() == 6 {
        match symbol.as_bytes()[0] {
            b'5' | b'6' => Exchange::Shanghai,
            b'0' | b'1' | b'3' => Exchange::Shenzhen,
            b'4' | b'8' => Exchange::Beijing,
            _ => Exchange::Shanghai,
        }
    } else if is_digits && symbol.len() == 5 {
        Exchange::HongKong
    } else if !symbol.is_empty() && symbol.bytes().all(|b| b.is_ascii_alphabetic()) {
        Exchange::Us
    } else {
        Exchange::Shanghai
    };
    (exchange, symbol.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_symbols_keep_their_exchange() {
        assert_eq!(split_symbol("sh510300"), (Exchange::Shanghai, "510300".to_string()));
        assert_eq!(split_symbol("SZ159915"), (Exchange::Shenzhen, "159915".to_string()));
        assert_eq!(split_symbol("sh000001"), (Exchange::Shanghai, "000001".to_string()));
    }

    #[test]
    fn test_bare_codes_are_placed_by_shape() {
        assert_eq!(split_symbol("510050").0, Exchange::Shanghai);
        assert_eq!(split_symbol("600519").0, Exchange::Shanghai);
        assert_eq!(split_symbol("159915").0, Exchange::Shenzhen);
        assert_eq!(split_symbol("300750").0, Exchange::Shenzhen);
        assert_eq!(split_symbol("830799").0, Exchange::Beijing);
        assert_eq!(split_symbol("00700").0, Exchange::HongKong);
        assert_eq!(split_symbol("QQQ").0, Exchange::Us);
    }

    #[test]
    fn test_ticker_starting_with_prefix_letters_is_not_split() {
        // "shop" is a US ticker, not Shanghai code "op"
        assert_eq!(split_symbol("SHOP"), (Exchange::Us, "SHOP".to_string()));
    }
}
