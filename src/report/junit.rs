//! JUnit XML report generation.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" errors="0" time="3.500">
//!   <testsuite name="yea-func" tests="2" failures="1" errors="0" skipped="0" time="3.500" timestamp="2024-05-01T12:00:00">
//!     <testcase name="1.1" classname="yea_func" time="1.000">
//!       <properties>
//!         <property name="max_rss_mb" value="120.5"/>
//!       </properties>
//!     </testcase>
//!     <testcase name="1.2" classname="yea_func" time="2.500">
//!       <failure type="failure" message="EXIT(1),BAD_HISTORY"/>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};

use super::{RunSummary, TestReport};

/// Writes a [`RunSummary`] as JUnit XML.
pub struct JUnitWriter {
    output_path: PathBuf,
    testsuite_name: String,
    classname: String,
}

impl JUnitWriter {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            testsuite_name: "yea-func".to_string(),
            classname: "yea_func".to_string(),
        }
    }

    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Writes the report, creating parent directories.
    pub fn write(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let xml = self.generate_xml(summary, Utc::now())?;
        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(&self.output_path, xml)
            .with_context(|| format!("Failed to write {}", self.output_path.display()))?;
        tracing::info!("JUnit XML written to {}", self.output_path.display());
        Ok(())
    }

    /// Renders the XML document.
    pub fn generate_xml(
        &self,
        summary: &RunSummary,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let tests = summary.reports.len().to_string();
        let failures = summary.failed().to_string();
        let time = format!(
            "{:.3}",
            summary
                .reports
                .iter()
                .map(|r| r.elapsed.as_secs_f64())
                .sum::<f64>()
        );

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", "0"));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let stamp = timestamp.format("%Y-%m-%dT%H:%M:%S").to_string();
        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", "0"));
        testsuite.push_attribute(("skipped", "0"));
        testsuite.push_attribute(("time", time.as_str()));
        testsuite.push_attribute(("timestamp", stamp.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for report in &summary.reports {
            self.write_testcase(&mut writer, report)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_testcase<W: std::io::Write>(
        &self,
        writer: &mut Writer<W>,
        report: &TestReport,
    ) -> anyhow::Result<()> {
        let mut testcase = BytesStart::new("testcase");
        testcase.push_attribute(("name", report.id.as_str()));
        testcase.push_attribute(("classname", self.classname.as_str()));
        testcase.push_attribute((
            "time",
            format!("{:.3}", report.elapsed.as_secs_f64()).as_str(),
        ));

        if report.passed() && report.properties.is_empty() {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
        writer.write_event(Event::Start(testcase))?;

        if !report.properties.is_empty() {
            writer.write_event(Event::Start(BytesStart::new("properties")))?;
            for (name, value) in &report.properties {
                let mut property = BytesStart::new("property");
                property.push_attribute(("name", name.as_str()));
                property.push_attribute(("value", value.to_string().as_str()));
                writer.write_event(Event::Empty(property))?;
            }
            writer.write_event(Event::End(BytesEnd::new("properties")))?;
        }

        if !report.passed() {
            let mut failure = BytesStart::new("failure");
            failure.push_attribute(("type", "failure"));
            failure.push_attribute(("message", report.failure_message().as_str()));
            writer.write_event(Event::Empty(failure))?;
        }

        writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        Ok(())
    }
}
