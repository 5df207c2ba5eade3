use std::fmt;

use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Eu,
    Asia,
    LatAm,
    Oceania,
    Other,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Eu => "EU",
            Region::Asia => "ASIA",
            Region::LatAm => "LATAM",
            Region::Oceania => "OCEANIA",
            Region::Other => "OTHER",
        }
    }

    /// Factor applied to an institution's cooldown period.
    pub fn cooldown_multiplier(&self) -> f64 {
        match self {
            Region::Eu => 1.5,
            Region::Asia => 2.0,
            Region::LatAm | Region::Oceania | Region::Other => 1.0,
        }
    }

    fn default_timezone(&self) -> &'static str {
        match self {
            Region::Eu => "Europe/Brussels",
            Region::Asia => "Asia/Singapore",
            Region::LatAm => "America/Sao_Paulo",
            Region::Oceania => "Australia/Sydney",
            Region::Other => "UTC",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Locale defaults for an institution's country.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionProfile {
    pub region: Region,
    pub country: Option<&'static str>,
    pub timezone: &'static str,
    pub charset: &'static str,
    /// Primary language tag, e.g. `de-DE`.
    pub locale: &'static str,
}

impl RegionProfile {
    pub fn cooldown_multiplier(&self) -> f64 {
        self.region.cooldown_multiplier()
    }

    /// `Accept-Language` preferring the local language, English second.
    pub fn accept_language(&self) -> String {
        let primary = self.locale.split('-').next().unwrap_or(self.locale);
        if primary == "en" {
            format!("{},en;q=0.9", self.locale)
        } else {
            format!("{},{primary};q=0.9,en;q=0.5", self.locale)
        }
    }

    fn fallback() -> Self {
        Self {
            region: Region::Other,
            country: None,
            timezone: Region::Other.default_timezone(),
            charset: "UTF-8",
            locale: "en",
        }
    }
}

// tld, region, timezone, charset, locale
const COUNTRIES: &[(&str, Region, &str, &str, &str)] = &[
    ("uk", Region::Eu, "Europe/London", "UTF-8", "en-GB"),
    ("ie", Region::Eu, "Europe/Dublin", "UTF-8", "en-IE"),
    ("de", Region::Eu, "Europe/Berlin", "UTF-8", "de-DE"),
    ("at", Region::Eu, "Europe/Vienna", "UTF-8", "de-AT"),
    ("ch", Region::Eu, "Europe/Zurich", "UTF-8", "de-CH"),
    ("fr", Region::Eu, "Europe/Paris", "UTF-8", "fr-FR"),
    ("be", Region::Eu, "Europe/Brussels", "UTF-8", "fr-BE"),
    ("nl", Region::Eu, "Europe/Amsterdam", "UTF-8", "nl-NL"),
    ("it", Region::Eu, "Europe/Rome", "UTF-8", "it-IT"),
    ("es", Region::Eu, "Europe/Madrid", "UTF-8", "es-ES"),
    ("pt", Region::Eu, "Europe/Lisbon", "UTF-8", "pt-PT"),
    ("se", Region::Eu, "Europe/Stockholm", "UTF-8", "sv-SE"),
    ("dk", Region::Eu, "Europe/Copenhagen", "UTF-8", "da-DK"),
    ("fi", Region::Eu, "Europe/Helsinki", "UTF-8", "fi-FI"),
    ("no", Region::Eu, "Europe/Oslo", "UTF-8", "nb-NO"),
    ("pl", Region::Eu, "Europe/Warsaw", "UTF-8", "pl-PL"),
    ("cz", Region::Eu, "Europe/Prague", "UTF-8", "cs-CZ"),
    ("eu", Region::Eu, "Europe/Brussels", "UTF-8", "en-GB"),
    ("jp", Region::Asia, "Asia/Tokyo", "Shift_JIS", "ja-JP"),
    ("cn", Region::Asia, "Asia/Shanghai", "GB18030", "zh-CN"),
    ("tw", Region::Asia, "Asia/Taipei", "Big5", "zh-TW"),
    ("hk", Region::Asia, "Asia/Hong_Kong", "Big5", "zh-HK"),
    ("kr", Region::Asia, "Asia/Seoul", "EUC-KR", "ko-KR"),
    ("sg", Region::Asia, "Asia/Singapore", "UTF-8", "en-SG"),
    ("in", Region::Asia, "Asia/Kolkata", "UTF-8", "en-IN"),
    ("th", Region::Asia, "Asia/Bangkok", "TIS-620", "th-TH"),
    ("my", Region::Asia, "Asia/Kuala_Lumpur", "UTF-8", "ms-MY"),
    ("br", Region::LatAm, "America/Sao_Paulo", "UTF-8", "pt-BR"),
    ("mx", Region::LatAm, "America/Mexico_City", "UTF-8", "es-MX"),
    ("ar", Region::LatAm, "America/Argentina/Buenos_Aires", "UTF-8", "es-AR"),
    ("cl", Region::LatAm, "America/Santiago", "UTF-8", "es-CL"),
    ("co", Region::LatAm, "America/Bogota", "UTF-8", "es-CO"),
    ("pe", Region::LatAm, "America/Lima", "UTF-8", "es-PE"),
    ("au", Region::Oceania, "Australia/Sydney", "UTF-8", "en-AU"),
    ("nz", Region::Oceania, "Pacific/Auckland", "UTF-8", "en-NZ"),
];

/// Profile for the country-code TLD of `host`.
pub fn profile_for_host(host: &str) -> RegionProfile {
    let tld = host
        .trim_end_matches('.')
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    COUNTRIES
        .iter()
        .find(|(code, ..)| *code == tld)
        .map(|&(code, region, timezone, charset, locale)| RegionProfile {
            region,
            country: Some(code),
            timezone,
            charset,
            locale,
        })
        .unwrap_or_else(RegionProfile::fallback)
}

pub fn profile_for_url(url: &str) -> RegionProfile {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(profile_for_host))
        .unwrap_or_else(RegionProfile::fallback)
}
