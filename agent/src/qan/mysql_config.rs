//! Start and stop statements for a given server.
//!
//! Which variables exist depends on the distribution and version, so the
//! statement lists are derived here and nowhere else.

use tracing::warn;

use crate::error::{MysqlError, MysqlResult};
use crate::mysql::{is_percona_family, MysqlQuery, Version, DISTRO_MARIADB};
use crate::qan::{CollectFrom, QanConfig};

const MIN_SUPPORTED: Version = Version::new(5, 1, 0);

/// `(start, stop, effective rate limit)` for `distro`/`version`.
pub fn mysql_commands(
    distro: &str,
    version: &str,
    config: &QanConfig,
) -> MysqlResult<(Vec<MysqlQuery>, Vec<MysqlQuery>, u32)> {
    let v = Version::parse(version)?;
    if v < MIN_SUPPORTED {
        return Err(unsupported(distro, version, config.collect_from));
    }
    match config.collect_from {
        CollectFrom::Slowlog => Ok(slowlog_commands(distro, v, config.rate_limit)),
        CollectFrom::Perfschema => perfschema_commands(distro, version, v),
    }
}

fn unsupported(distro: &str, version: &str, source: CollectFrom) -> MysqlError {
    MysqlError::UnsupportedVersion {
        distro: distro.to_string(),
        version: version.to_string(),
        source_name: source.as_str().to_string(),
    }
}

fn set(stmt: &str) -> MysqlQuery {
    MysqlQuery::set(stmt)
}

fn slowlog_commands(distro: &str, v: Version, rate_limit: u32) -> (Vec<MysqlQuery>, Vec<MysqlQuery>, u32) {
    let mut start = vec![set("SET GLOBAL slow_query_log=OFF")];
    let mut effective_rate = 1;

    if is_percona_family(distro) {
        if v.series() >= (5, 5) {
            start.push(set("SET GLOBAL slow_query_log_use_global_control='all'"));
        }
        start.push(set("SET GLOBAL log_slow_verbosity='full'"));
        match v.series() {
            (5, 1) => {}
            (5, 5) => start.push(set("SET GLOBAL log_slow_admin_statements=ON")),
            _ => {
                start.push(set("SET GLOBAL log_slow_admin_statements=ON"));
                start.push(set("SET GLOBAL log_slow_slave_statements=ON"));
            }
        }
        if rate_limit > 1 {
            let supported = match v.series() {
                (5, 5) => v >= Version::new(5, 5, 34),
                _ => v >= Version::new(5, 6, 13),
            };
            if supported {
                start.push(set("SET GLOBAL log_slow_rate_type='query'"));
                start.push(set(&format!("SET GLOBAL log_slow_rate_limit={}", rate_limit)));
                effective_rate = rate_limit;
            } else {
                warn!(version = %v, rate_limit, "server cannot rate limit per query, logging every query");
            }
        }
    } else if distro == DISTRO_MARIADB {
        start.push(set("SET GLOBAL log_slow_verbosity='query_plan'"));
        if rate_limit > 1 && v.series() >= (5, 5) {
            start.push(set(&format!("SET GLOBAL log_slow_rate_limit={}", rate_limit)));
            effective_rate = rate_limit;
        }
        if v.major >= 10 {
            start.push(set("SET GLOBAL log_slow_admin_statements=ON"));
        }
    } else if v >= Version::new(5, 6, 11) {
        start.push(set("SET GLOBAL log_slow_admin_statements=ON"));
        start.push(set("SET GLOBAL log_slow_slave_statements=ON"));
    }

    start.push(set("SET GLOBAL long_query_time=0"));
    start.push(MysqlQuery {
        set: "SET GLOBAL slow_query_log=ON".to_string(),
        verify: "SELECT @@GLOBAL.slow_query_log".to_string(),
        expect: "1".to_string(),
    });

    let stop = vec![
        set("SET GLOBAL slow_query_log=OFF"),
        set("SET GLOBAL long_query_time=10"),
    ];
    (start, stop, effective_rate)
}

fn perfschema_commands(
    distro: &str,
    version: &str,
    v: Version,
) -> MysqlResult<(Vec<MysqlQuery>, Vec<MysqlQuery>, u32)> {
    let supported = if distro == DISTRO_MARIADB {
        v.major >= 10
    } else {
        v.series() >= (5, 6)
    };
    if !supported {
        return Err(unsupported(distro, version, CollectFrom::Perfschema));
    }
    let start = vec![
        set("UPDATE performance_schema.setup_consumers SET ENABLED = 'YES' WHERE NAME = 'statements_digest'"),
        set("UPDATE performance_schema.setup_instruments SET ENABLED = 'YES', TIMED = 'YES' WHERE NAME LIKE 'statement/sql/%'"),
        set("TRUNCATE performance_schema.events_statements_summary_by_digest"),
    ];
    Ok((start, Vec::new(), 1))
}
