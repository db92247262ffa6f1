// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Failure diagnostics: silicon dumps, trace analyzer logs and the OS
//! machine-check log.

use crate::OsFamily;
use crate::PostCode;
use crate::config::Named;
use crate::sut::DebugReport;
use crate::sut::SiliconDebug;
use crate::sut::SutOs;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

const MCE_LOG_TIMEOUT: Duration = Duration::from_secs(60);

/// A silicon state dump captured after a health-check failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[expect(missing_docs)] // Named after the silicon domain they dump.
pub enum DumpDomain {
    Mca,
    Mcu,
    Upi,
    UpiError,
    S3m,
    Pmc,
    Punit,
    PcuData,
    PmcDebug,
    PmcHisto,
    EbcState,
    DdrPhy,
    Memss,
    S3mCfrCheck,
    SutHang,
}

impl Named for DumpDomain {
    const WHAT: &'static str = "dump domain";
    const ALL: &'static [Self] = &[
        Self::Mca,
        Self::Mcu,
        Self::Upi,
        Self::UpiError,
        Self::S3m,
        Self::Pmc,
        Self::Punit,
        Self::PcuData,
        Self::PmcDebug,
        Self::PmcHisto,
        Self::EbcState,
        Self::DdrPhy,
        Self::Memss,
        Self::S3mCfrCheck,
        Self::SutHang,
    ];

    fn name(&self) -> &'static str {
        match self {
            Self::Mca => "mca_dump",
            Self::Mcu => "mcu_dump",
            Self::Upi => "upi_dump",
            Self::UpiError => "upi_error_dump",
            Self::S3m => "s3m_dump",
            Self::Pmc => "pmc_dump",
            Self::Punit => "punit_dump",
            Self::PcuData => "pcu_data",
            Self::PmcDebug => "pmc_debug",
            Self::PmcHisto => "pmc_histo",
            Self::EbcState => "ebc_state",
            Self::DdrPhy => "ddr_phy_dump",
            Self::Memss => "memss_dump",
            Self::S3mCfrCheck => "s3m_cfr_check",
            Self::SutHang => "sut_soft_hard_hung",
        }
    }
}

/// Capture every domain in `domains` into `dir`, one `<domain>.log` per
/// dump. Failures are logged and skipped. Returns the number captured.
pub fn collect_silicon_dumps(
    silicon: &mut dyn SiliconDebug,
    domains: &[DumpDomain],
    dir: &Path,
) -> usize {
    let mut captured = 0;
    for &domain in domains {
        let result = silicon
            .capture(DebugReport::Dump(domain))
            .and_then(|text| {
                fs_err::create_dir_all(dir)?;
                fs_err::write(dir.join(format!("{}.log", domain.name())), text)?;
                Ok(())
            });
        match result {
            Ok(()) => captured += 1,
            Err(e) => tracing::error!(
                domain = domain.name(),
                error = e.as_ref() as &dyn std::error::Error,
                "failed to capture silicon dump"
            ),
        }
    }
    tracing::info!(captured, requested = domains.len(), dir = %dir.display(), "silicon dumps collected");
    captured
}

/// Decides when trace analyzer logs are collected for a stuck post code.
///
/// Each distinct post code is analyzed once; codes on the ignore list are
/// never analyzed. Without configured analyzers, every stuck code is just
/// remembered.
pub struct PostCodeTriage {
    analyzers: Vec<String>,
    ignored: BTreeSet<PostCode>,
}

impl PostCodeTriage {
    /// Start with the configured analyzers and ignore list.
    pub fn new(analyzers: Vec<String>, ignored: impl IntoIterator<Item = PostCode>) -> Self {
        Self {
            analyzers,
            ignored: ignored.into_iter().collect(),
        }
    }

    /// Whether `code` no longer needs analysis.
    pub fn is_ignored(&self, code: PostCode) -> bool {
        self.ignored.contains(&code)
    }

    /// Collect analyzer logs for `code` into `dir` unless it is ignored.
    /// Returns true if logs were collected.
    pub fn collect(&mut self, silicon: &mut dyn SiliconDebug, code: PostCode, dir: &Path) -> bool {
        if self.is_ignored(code) {
            tracing::info!(post_code = %code, "post code already triaged, skipping analyzers");
            return false;
        }
        if self.analyzers.is_empty() {
            self.ignored.insert(code);
            return false;
        }

        let result = fs_err::create_dir_all(dir)
            .map_err(anyhow::Error::from)
            .and_then(|()| silicon.collect_analyzer_logs(&self.analyzers, code, dir));
        match result {
            Ok(()) => {
                tracing::info!(post_code = %code, dir = %dir.display(), "analyzer logs collected");
                self.ignored.insert(code);
                true
            }
            Err(e) => {
                tracing::error!(
                    post_code = %code,
                    error = e.as_ref() as &dyn std::error::Error,
                    "failed to collect analyzer logs"
                );
                false
            }
        }
    }
}

fn mce_log_commands(os: OsFamily) -> Option<(&'static str, &'static str)> {
    match os {
        OsFamily::Linux => Some((
            "dmesg | grep -i -E 'machine check|mce:|hardware error' || true",
            "dmesg -C",
        )),
        OsFamily::Windows => Some((
            "wevtutil qe System /q:\"*[System[Provider[@Name='Microsoft-Windows-WHEA-Logger']]]\" /f:text /c:50",
            "wevtutil cl System",
        )),
        OsFamily::Other => None,
    }
}

/// Machine-check errors reported in the OS log since it was last cleared.
pub fn check_mce_log(os: &mut dyn SutOs) -> anyhow::Result<Vec<String>> {
    let Some((query, _)) = mce_log_commands(os.os_family()) else {
        return Ok(Vec::new());
    };
    let output = os.execute_stdout(query, MCE_LOG_TIMEOUT)?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Clear the OS machine-check log.
pub fn clear_mce_log(os: &mut dyn SutOs) -> anyhow::Result<()> {
    if let Some((_, clear)) = mce_log_commands(os.os_family()) {
        os.execute_stdout(clear, MCE_LOG_TIMEOUT)?;
    }
    Ok(())
}
