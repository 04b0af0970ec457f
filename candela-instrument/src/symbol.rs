use crate::{error::InstrumentError, market::MarketType};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Trading pair symbol in canonical upper-case form, e.g. `BTCUSDT`.
///
/// Coin-margined perpetuals canonically carry a `_PERP` suffix
/// (`BTCUSD_PERP`); [`Symbol::canonical`] appends it when the caller passes
/// the bare pair.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
pub struct Symbol(SmolStr);

/// Suffix marking coin-margined perpetual contracts.
const PERP_SUFFIX: &str = "_PERP";

impl Symbol {
    /// Construct a [`Symbol`], upper-casing the input.
    ///
    /// No market-specific validation happens here; call
    /// [`Symbol::canonical`] with the target market before using the symbol
    /// in a request.
    pub fn new(symbol: impl AsRef<str>) -> Self {
        Self(SmolStr::new(symbol.as_ref().to_ascii_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate this symbol against `market` and return the canonical form.
    ///
    /// For coin-margined futures a bare pair is canonicalized by appending
    /// `_PERP`; for spot and USDT-margined futures a `_PERP` suffix is
    /// rejected.
    pub fn canonical(&self, market: MarketType) -> Result<Symbol, InstrumentError> {
        let raw = self.as_str();

        if raw.is_empty() {
            return Err(self.invalid("symbol is empty"));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(self.invalid("symbol must be upper-case alphanumeric"));
        }

        let has_perp = raw.ends_with(PERP_SUFFIX);
        match market {
            MarketType::Spot | MarketType::FuturesUsdt => {
                if has_perp {
                    return Err(self.invalid("_PERP suffix is only valid on coin-margined markets"));
                }
                if raw.contains('_') {
                    return Err(self.invalid("underscores are only valid in the _PERP suffix"));
                }
                if raw.len() < 5 {
                    return Err(self.invalid("symbol is too short"));
                }
                Ok(self.clone())
            }
            MarketType::FuturesCoin => {
                let base = raw.strip_suffix(PERP_SUFFIX).unwrap_or(raw);
                if base.contains('_') {
                    return Err(self.invalid("underscores are only valid in the _PERP suffix"));
                }
                if base.len() < 5 {
                    return Err(self.invalid("symbol is too short"));
                }
                if has_perp {
                    Ok(self.clone())
                } else {
                    Ok(Symbol(SmolStr::new(format!("{base}{PERP_SUFFIX}"))))
                }
            }
        }
    }

    fn invalid(&self, reason: &str) -> InstrumentError {
        InstrumentError::InvalidSymbol {
            symbol: self.as_str().to_string(),
            reason: reason.to_string(),
        }
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Symbol {
    fn from(symbol: &str) -> Self {
        Symbol::new(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_upper_cases() {
        assert_eq!(Symbol::new("btcusdt").as_str(), "BTCUSDT");
    }

    #[test]
    fn test_spot_canonical_accepts_plain_pair() {
        let symbol = Symbol::new("BTCUSDT").canonical(MarketType::Spot).unwrap();
        assert_eq!(symbol.as_str(), "BTCUSDT");
    }

    #[test]
    fn test_spot_rejects_perp_suffix() {
        assert!(
            Symbol::new("BTCUSD_PERP")
                .canonical(MarketType::Spot)
                .is_err()
        );
        assert!(
            Symbol::new("BTCUSD_PERP")
                .canonical(MarketType::FuturesUsdt)
                .is_err()
        );
    }

    #[test]
    fn test_coin_margined_appends_perp() {
        let symbol = Symbol::new("BTCUSD")
            .canonical(MarketType::FuturesCoin)
            .unwrap();
        assert_eq!(symbol.as_str(), "BTCUSD_PERP");
    }

    #[test]
    fn test_coin_margined_keeps_existing_perp() {
        let symbol = Symbol::new("BTCUSD_PERP")
            .canonical(MarketType::FuturesCoin)
            .unwrap();
        assert_eq!(symbol.as_str(), "BTCUSD_PERP");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Symbol::new("").canonical(MarketType::Spot).is_err());
        assert!(Symbol::new("BTC").canonical(MarketType::Spot).is_err());
        assert!(Symbol::new("BTC-USD").canonical(MarketType::Spot).is_err());
    }
}
