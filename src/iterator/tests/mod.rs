mod tests_seek;
