//! Renders the proxy's XMLTV artifact: `<channel>` elements for kept
//! channels, then `<programme>` elements ordered by (channel_id, start).
//! Programs whose channel was filtered out are dropped here.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use crate::errors::AppResult;
use crate::pipeline::{PipelineContext, PipelineStage};
use crate::sources::xmltv::format_xmltv_time;

pub struct RenderXmltvStage;

#[async_trait]
impl PipelineStage for RenderXmltvStage {
    fn name(&self) -> &'static str {
        "render_xmltv"
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> AppResult<()> {
        let kept_ids: HashSet<&str> = ctx
            .channels
            .iter()
            .filter_map(|c| c.tvg_id.as_deref())
            .filter(|id| !id.is_empty())
            .collect();

        let mut output = String::with_capacity(4096);
        output.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        output.push_str("<tv generator-info-name=\"tvarr\">\n");

        let mut channels_rendered: HashSet<&str> = HashSet::new();
        for channel in &ctx.channels {
            let Some(tvg_id) = channel.tvg_id.as_deref().filter(|id| !id.is_empty()) else {
                continue;
            };
            if !channels_rendered.insert(tvg_id) {
                continue;
            }
            output.push_str(&format!("  <channel id=\"{}\">\n", escape(tvg_id)));
            output.push_str(&format!(
                "    <display-name>{}</display-name>\n",
                escape(&channel.channel_name)
            ));
            if let Some(logo) = channel.tvg_logo.as_deref().filter(|l| !l.is_empty()) {
                output.push_str(&format!("    <icon src=\"{}\"/>\n", escape(logo)));
            }
            output.push_str("  </channel>\n");
        }

        let mut programs: Vec<_> = ctx
            .programs
            .iter()
            .filter(|p| kept_ids.contains(p.channel_id.as_str()))
            .collect();
        programs.sort_by(|a, b| a.channel_id.cmp(&b.channel_id).then(a.start.cmp(&b.start)));
        let dropped = ctx.programs.len() - programs.len();

        for program in &programs {
            output.push_str(&format!(
                "  <programme start=\"{}\" stop=\"{}\" channel=\"{}\">\n",
                format_xmltv_time(program.start),
                format_xmltv_time(program.stop),
                escape(&program.channel_id)
            ));
            output.push_str(&format!("    <title>{}</title>\n", escape(&program.title)));
            if let Some(desc) = program.description.as_deref().filter(|d| !d.is_empty()) {
                output.push_str(&format!("    <desc>{}</desc>\n", escape(desc)));
            }
            if let Some(category) = program.category.as_deref().filter(|c| !c.is_empty()) {
                output.push_str(&format!(
                    "    <category>{}</category>\n",
                    escape(category)
                ));
            }
            if let Some(icon) = program.icon.as_deref().filter(|i| !i.is_empty()) {
                output.push_str(&format!("    <icon src=\"{}\"/>\n", escape(icon)));
            }
            if let Some(rating) = program.rating.as_deref().filter(|r| !r.is_empty()) {
                output.push_str(&format!(
                    "    <rating><value>{}</value></rating>\n",
                    escape(rating)
                ));
            }
            if program.is_new {
                output.push_str("    <new/>\n");
            }
            if program.is_premiere {
                output.push_str("    <premiere/>\n");
            }
            if program.is_live {
                output.push_str("    <live/>\n");
            }
            output.push_str("  </programme>\n");
        }
        output.push_str("</tv>\n");

        debug!(
            proxy = %ctx.proxy.name,
            channels = channels_rendered.len(),
            programs = programs.len(),
            dropped,
            "rendered xmltv"
        );
        ctx.counters.record("render_xmltv", programs.len(), dropped);
        ctx.stage_progress(
            "render_xmltv",
            100.0,
            &format!("{} programmes", programs.len()),
        );
        ctx.xmltv_output = Some(output);
        Ok(())
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_xml_metacharacters() {
        assert_eq!(escape("Tom & Jerry <live>"), "Tom &amp; Jerry &lt;live&gt;");
        assert_eq!(escape("say \"hi\""), "say &quot;hi&quot;");
    }
}
