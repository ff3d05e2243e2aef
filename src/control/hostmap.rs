//! Static hostname to HOB mappings.
//!
//! Legacy driver apps address city-specific hostnames, so a fixed table is
//! enough; everything newer carries an explicit `city` parameter instead.

/// Looks up the HOB code for a known legacy hostname.
pub fn lookup(host: &str) -> Option<&'static str> {
    let code = match host {
        "api-driver.elasticride.com"
        | "api-driver-test.elasticride.com"
        | "api-driver-staging.elasticride.com"
        | "api-driver-london.elasticride.com"
        | "api-driver-london-test.elasticride.com"
        | "api-driver-london-staging.elasticride.com" => "LON",

        "api-driver-dublin.elasticride.com"
        | "api-driver-dublin-test.elasticride.com"
        | "api-driver-dublin-staging.elasticride.com" => "DUB",

        "api-driver-boston.elasticride.com"
        | "api-driver-boston-test.elasticride.com"
        | "api-driver-boston-staging.elasticride.com" => "BOS",

        "api-driver-chicago.elasticride.com"
        | "api-driver-chicago-test.elasticride.com"
        | "api-driver-chicago-staging.elasticride.com" => "CHI",

        "api-driver-nyc.elasticride.com"
        | "api-driver-nyc-test.elasticride.com"
        | "api-driver-nyc-staging.elasticride.com" => "NYC",

        "api-driver-toronto.elasticride.com"
        | "api-driver-toronto-test.elasticride.com"
        | "api-driver-toronto-staging.elasticride.com" => "TOR",

        "api-driver-montreal.elasticride.com"
        | "api-driver-montreal-test.elasticride.com"
        | "api-driver-montreal-staging.elasticride.com" => "MTR",

        "api-driver-madrid.elasticride.com"
        | "api-driver-madrid-test.elasticride.com"
        | "api-driver-madrid-staging.elasticride.com" => "MAD",

        "api-driver-barcelona.elasticride.com"
        | "api-driver-barcelona-test.elasticride.com"
        | "api-driver-barcelona-staging.elasticride.com" => "BCN",

        "api-driver-dc.elasticride.com"
        | "api-driver-dc-test.elasticride.com"
        | "api-driver-dc-staging.elasticride.com"
        | "api-driver-washington.elasticride.com"
        | "api-driver-washington-test.elasticride.com"
        | "api-driver-washington-staging.elasticride.com" => "WAS",

        "api-driver-osaka.elasticride.com"
        | "api-driver-osaka-test.elasticride.com"
        | "api-driver-osaka-staging.elasticride.com" => "OSA",

        "api-driver-tokyo.elasticride.com"
        | "api-driver-tokyo-test.elasticride.com"
        | "api-driver-tokyo-staging.elasticride.com" => "TYO",

        _ => return None,
    };
    Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_hosts() {
        assert_eq!(lookup("api-driver.elasticride.com"), Some("LON"));
        assert_eq!(lookup("api-driver-dublin-test.elasticride.com"), Some("DUB"));
        assert_eq!(lookup("api-driver-washington.elasticride.com"), Some("WAS"));
    }

    #[test]
    fn test_unknown_host() {
        assert_eq!(lookup("foo.com"), None);
        assert_eq!(lookup(""), None);
    }
}
