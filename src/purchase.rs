//! Purchase instrumentation.
use std::sync::OnceLock;

use derive_more::{Deref, DerefMut};
use regex::Regex;

use crate::{Session, Transaction};

/// Category of purchase transactions.
pub const PURCHASE_CATEGORY: &str = "Purchase";

/// Currency reported when a symbol does not identify a single currency.
pub const UNKNOWN_CURRENCY: &str = "unknown";

/// A [`Transaction`] in the [`PURCHASE_CATEGORY`] with purchase specific properties.
///
/// Lifecycle calls (`begin`, `update`, `end`, ...) are available through [`Transaction`].
///
/// ```no_run
/// # use std::time::Duration;
/// # use splyt::{Session, TimeoutMode, TXN_SUCCESS};
/// # let session = Session::new()?;
/// let mut purchase = session
///     .purchase()
///     .id("order-17")
///     .price(4.99, "usd")
///     .item_name("gem pack");
/// purchase.begin(Duration::from_secs(60), TimeoutMode::Transaction);
/// purchase.end(TXN_SUCCESS);
/// # Ok::<(), splyt::Error>(())
/// ```
#[derive(Deref, DerefMut)]
pub struct PurchaseTransaction<'a>(Transaction<'a>);

impl<'a> PurchaseTransaction<'a> {
    pub(crate) fn new(session: &'a Session) -> PurchaseTransaction<'a> {
        PurchaseTransaction(Transaction::new(session, PURCHASE_CATEGORY))
    }

    /// Set the transaction id. Only required when several purchases may be in flight at once.
    pub fn id(self, transaction_id: impl Into<String>) -> PurchaseTransaction<'a> {
        PurchaseTransaction(self.0.id(transaction_id))
    }

    /// Set a property.
    pub fn with_property(
        self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> PurchaseTransaction<'a> {
        PurchaseTransaction(self.0.with_property(key, value))
    }

    /// Report the price of the purchased item.
    ///
    /// For real currencies `currency` is an ISO 4217 code (case insensitive) or a currency symbol.
    /// Anything else is a virtual currency name (e.g., `"gems"`); only its ASCII characters are
    /// kept.
    pub fn price(self, amount: f64, currency: &str) -> PurchaseTransaction<'a> {
        let price: serde_json::Map<String, serde_json::Value> =
            [(normalize_currency(currency), amount.into())].into_iter().collect();
        self.with_property("price", price)
    }

    /// Report an application defined offer id, e.g. a promotion.
    pub fn offer_id(self, offer_id: impl Into<String>) -> PurchaseTransaction<'a> {
        self.with_property("offerId", offer_id.into())
    }

    /// Report the name of the purchased item.
    pub fn item_name(self, item_name: impl Into<String>) -> PurchaseTransaction<'a> {
        self.with_property("itemName", item_name.into())
    }

    /// Report where in the application the purchase happened.
    pub fn point_of_sale(self, point_of_sale: impl Into<String>) -> PurchaseTransaction<'a> {
        self.with_property("pointOfSale", point_of_sale.into())
    }
}

/// ISO 4217 codes of currencies in circulation.
const CURRENCY_CODES: &[&str] = &[
    "AED", "AFN", "ALL", "AMD", "ANG", "AOA", "ARS", "AUD", "AWG", "AZN", "BAM", "BBD", "BDT",
    "BGN", "BHD", "BIF", "BMD", "BND", "BOB", "BRL", "BSD", "BTN", "BWP", "BYN", "BZD", "CAD",
    "CDF", "CHF", "CLP", "CNY", "COP", "CRC", "CUP", "CVE", "CZK", "DJF", "DKK", "DOP", "DZD",
    "EGP", "ERN", "ETB", "EUR", "FJD", "FKP", "GBP", "GEL", "GHS", "GIP", "GMD", "GNF", "GTQ",
    "GYD", "HKD", "HNL", "HTG", "HUF", "IDR", "ILS", "INR", "IQD", "IRR", "ISK", "JMD", "JOD",
    "JPY", "KES", "KGS", "KHR", "KMF", "KPW", "KRW", "KWD", "KYD", "KZT", "LAK", "LBP", "LKR",
    "LRD", "LSL", "LYD", "MAD", "MDL", "MGA", "MKD", "MMK", "MNT", "MOP", "MRU", "MUR", "MVR",
    "MWK", "MXN", "MYR", "MZN", "NAD", "NGN", "NIO", "NOK", "NPR", "NZD", "OMR", "PAB", "PEN",
    "PGK", "PHP", "PKR", "PLN", "PYG", "QAR", "RON", "RSD", "RUB", "RWF", "SAR", "SBD", "SCR",
    "SDG", "SEK", "SGD", "SHP", "SLE", "SOS", "SRD", "SSP", "STN", "SYP", "SZL", "THB", "TJS",
    "TMT", "TND", "TOP", "TRY", "TTD", "TWD", "TZS", "UAH", "UGX", "USD", "UYU", "UZS", "VES",
    "VND", "VUV", "WST", "XAF", "XCD", "XOF", "XPF", "YER", "ZAR", "ZMW", "ZWL",
];

/// Currency symbols and the codes that use them.
const CURRENCY_SYMBOLS: &[(&str, &[&str])] = &[
    ("$", &["USD", "CAD", "AUD", "NZD", "MXN", "SGD", "HKD", "ARS", "CLP", "COP"]),
    ("€", &["EUR"]),
    ("£", &["GBP"]),
    ("¥", &["JPY", "CNY"]),
    ("₹", &["INR"]),
    ("₩", &["KRW"]),
    ("₽", &["RUB"]),
    ("₺", &["TRY"]),
    ("₪", &["ILS"]),
    ("₫", &["VND"]),
    ("₱", &["PHP"]),
    ("฿", &["THB"]),
    ("₴", &["UAH"]),
    ("₦", &["NGN"]),
    ("₡", &["CRC"]),
    ("₸", &["KZT"]),
    ("₾", &["GEL"]),
    ("R$", &["BRL"]),
    ("zł", &["PLN"]),
    ("Kč", &["CZK"]),
    ("Ft", &["HUF"]),
    ("kr", &["SEK", "NOK", "DKK", "ISK"]),
    ("RM", &["MYR"]),
    ("Rp", &["IDR"]),
    ("S/", &["PEN"]),
    ("NT$", &["TWD"]),
];

/// Turn user supplied currency text into the currency reported with a price.
pub(crate) fn normalize_currency(currency: &str) -> String {
    let currency = currency.trim();

    let code = currency.to_uppercase();
    if CURRENCY_CODES.contains(&code.as_str()) {
        return code;
    }

    if let Some((_, codes)) = CURRENCY_SYMBOLS
        .iter()
        .find(|(symbol, _)| symbol.eq_ignore_ascii_case(currency))
    {
        return match codes {
            [code] => (*code).to_owned(),
            _ => UNKNOWN_CURRENCY.to_owned(),
        };
    }

    // Virtual currency.
    strip_non_ascii(currency)
}

fn strip_non_ascii(value: &str) -> String {
    static NON_ASCII: OnceLock<Regex> = OnceLock::new();
    NON_ASCII
        .get_or_init(|| Regex::new(r"[^\x00-\x7F]").expect("non-ASCII pattern is valid"))
        .replace_all(value, "")
        .into_owned()
}
