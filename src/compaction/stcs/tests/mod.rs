mod tests_minor;
